pub mod channel;

pub use channel::{ChannelReader, ChannelWriter};
