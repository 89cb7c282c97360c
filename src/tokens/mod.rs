mod codec;
mod vocabulary;

pub use codec::{EventDecoder, MAX_FRAME_TOKENS, TimeCodec};
pub use vocabulary::{Symbol, Token, TokenRole, Vocabulary};
