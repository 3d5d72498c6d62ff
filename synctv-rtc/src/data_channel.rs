use std::fmt;

use crate::channel::{ChannelCore, RtcChannel};
use crate::engine::read_sized;
use crate::error::Result;

/// A labeled SCTP stream
pub struct DataChannel {
    core: ChannelCore,
    stream_id: u16,
    label: String,
}

impl DataChannel {
    /// Wrap an engine handle, fetching the immutable stream id and label.
    pub(crate) fn from_engine(core: ChannelCore) -> Result<Self> {
        let handle = core.handle();
        let stream_id = core.engine().data_channel_stream(handle)?;
        let label = read_sized(|buf| core.engine().data_channel_label(handle, buf))?;
        Ok(Self {
            core,
            stream_id,
            label,
        })
    }

    #[must_use]
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn send_text(&self, text: &str) -> Result<()> {
        self.core.send(text.as_bytes())
    }
}

impl RtcChannel for DataChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("handle", &self.core.handle())
            .field("stream_id", &self.stream_id)
            .field("label", &self.label)
            .field("open", &self.is_open().get())
            .finish()
    }
}
