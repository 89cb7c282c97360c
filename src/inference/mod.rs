mod context;
mod driver;
mod markov;
mod model;
mod sampler;
#[cfg(test)]
pub(crate) mod testing;

pub use context::{ContextWindow, Flush, Speculation, WindowPolicy, WindowState};
pub use driver::{DriverSettings, InferenceDriver, IngestReport, InputProbe, RunReport};
pub use markov::{MarkovCache, MarkovModel};
pub use model::{CacheState, Distribution, ForwardPass};
pub use sampler::{Sampler, SamplingConfig};
