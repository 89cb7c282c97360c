pub mod device;
mod io;
mod router;

pub use io::IoLoop;
pub use router::{ChannelRouter, MidiSink, OUTPUT_CHANNEL, route_input};
