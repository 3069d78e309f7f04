//! Channel members: a channel paired with its progress listener.

use std::fmt;
use std::sync::Arc;

use crate::channel::PipelineChannel;
use crate::progress::ProgressListener;

/// One source channel owned by an importer, with the listener that receives
/// its progress.
///
/// Cloning is cheap; clones refer to the same channel and listener and
/// compare equal by name.
#[derive(Clone)]
pub struct ChannelMember {
    name: Arc<str>,
    channel: Arc<dyn PipelineChannel>,
    listener: Arc<dyn ProgressListener>,
}

impl ChannelMember {
    /// Creates a member. `name` must be unique within one importer.
    #[must_use]
    pub fn new(
        name: impl Into<Arc<str>>,
        channel: Arc<dyn PipelineChannel>,
        listener: Arc<dyn ProgressListener>,
    ) -> Self {
        Self {
            name: name.into(),
            channel,
            listener,
        }
    }

    /// Member name, typically the shard's data source name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The member's channel.
    #[must_use]
    pub fn channel(&self) -> &dyn PipelineChannel {
        self.channel.as_ref()
    }

    /// The member's progress listener.
    #[must_use]
    pub fn listener(&self) -> &dyn ProgressListener {
        self.listener.as_ref()
    }
}

impl PartialEq for ChannelMember {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ChannelMember {}

impl fmt::Debug for ChannelMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelMember")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
