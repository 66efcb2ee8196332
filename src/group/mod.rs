pub mod config;
pub mod cursor;
pub mod driver;
pub mod fragment;
pub mod fragments_map;
pub mod group_media;
pub mod peer_media;

pub use config::GroupMediaConfig;
pub use driver::GroupMediaDriver;
pub use group_media::{GroupMedia, GroupObserver};
pub use peer_media::PeerMedia;

use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Identity of a mesh peer (the hex id the rendezvous layer hands out).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PeerId(Arc<str>);

impl PeerId {
    pub fn new(id: impl Into<Arc<str>>) -> PeerId {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        PeerId::new(value)
    }
}
