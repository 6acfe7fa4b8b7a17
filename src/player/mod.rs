// 播放器核心模块

pub mod audio_output;
pub mod audio_renderer;
pub mod codec;
pub mod demuxer;
pub mod frame;
#[cfg(feature = "hwaccel")]
pub mod hw;
pub mod input;
pub mod manager;
pub mod queue;
pub mod renderer;
pub mod resampler;
pub mod stream_decoder;
pub mod video_renderer;
pub mod video_sink;
pub mod worker;

pub use audio_output::{AudioSink, AudioSinkFormat, CpalAudioOutput};
pub use audio_renderer::AudioRenderer;
pub use codec::{Codec, CodecInfo};
pub use demuxer::Demuxer;
pub use frame::{Frame, FramePayload, Packet};
pub use input::{open_input, probe_media, MediaOpener, OpenedMedia};
pub use manager::PlaybackManager;
pub use renderer::Renderer;
pub use stream_decoder::{StreamDecoder, StreamDecoderShared};
pub use video_renderer::VideoRenderer;
pub use video_sink::{NullVideoSink, VideoSink};
