pub mod decoder;
pub mod frame;
pub mod packet;
pub mod worker;

pub use decoder::{DecodedImage, Decoder, FrameDecoder};
pub use frame::{Frame, FrameInfo, PixelFormat, SlotId};
pub use packet::{ChannelSource, Codec, ImageSequence, IterSource, Packet, PacketSource};
pub use worker::{DecodeWorker, EndReason, PipelineEvent, WorkerHandle, WorkerReport, WorkerStats};
