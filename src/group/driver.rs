use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant};
use tracing::debug;

use crate::group::fragment::ParsedFragment;
use crate::group::group_media::{GroupMedia, GroupObserver};
use crate::group::peer_media::PeerMedia;
use crate::group::PeerId;
use crate::wire::MediaType;

/// Cadence of the periodic `manage` tick; fine enough for the pull delay,
/// coarse enough to stay cheap.
pub const MANAGE_TICK: Duration = Duration::from_millis(50);

struct DriverInner {
    group: GroupMedia,
    sink: Box<dyn GroupObserver>,
}

/// Async shell around one [`GroupMedia`].
///
/// The engine itself is single-threaded cooperative; this wrapper serializes
/// every ingress callback and the periodic tick behind one lock, which is
/// the "same serial executor" rule for running it on a multi-threaded
/// runtime.
pub struct GroupMediaDriver {
    inner: Arc<Mutex<DriverInner>>,
}

impl GroupMediaDriver {
    pub fn new(group: GroupMedia, sink: Box<dyn GroupObserver>) -> GroupMediaDriver {
        GroupMediaDriver {
            inner: Arc::new(Mutex::new(DriverInner { group, sink })),
        }
    }

    /// Drive the engine until the task is dropped.
    pub async fn run(&self) {
        debug!("starting group media manage loop");
        let mut ticker = interval(MANAGE_TICK);
        loop {
            ticker.tick().await;
            let inner = &mut *self.inner.lock().await;
            inner.group.manage(Instant::now(), inner.sink.as_mut());
        }
    }

    pub async fn add_peer(&self, peer: PeerMedia) {
        let inner = &mut *self.inner.lock().await;
        inner.group.add_peer(peer, inner.sink.as_mut());
    }

    pub async fn close_peer(&self, peer_id: &PeerId) {
        self.inner.lock().await.group.close_peer(peer_id);
    }

    pub async fn on_media(&self, media_type: MediaType, time: u32, data: &[u8]) {
        self.inner.lock().await.group.on_media(media_type, time, data);
    }

    pub async fn on_fragment(&self, peer_id: &PeerId, fragment: ParsedFragment) {
        let inner = &mut *self.inner.lock().await;
        inner.group.on_fragment(peer_id, fragment, inner.sink.as_mut());
    }

    pub async fn on_fragments_map(&self, peer_id: &PeerId, map_id: u64, bitmap: &[u8]) {
        self.inner
            .lock()
            .await
            .group
            .on_fragments_map(peer_id, map_id, bitmap, Instant::now());
    }

    pub async fn on_play_pull(&self, peer_id: &PeerId, index: u64) {
        self.inner.lock().await.group.on_play_pull(peer_id, index);
    }

    pub async fn on_play_push(&self, peer_id: &PeerId, mode: u8) {
        self.inner.lock().await.group.on_play_push(peer_id, mode);
    }

    pub async fn on_acknowledgment(
        &self,
        peer_id: &PeerId,
        writer_id: u64,
        ack: &[u8],
    ) -> anyhow::Result<()> {
        let mut buf = ack;
        self.inner
            .lock()
            .await
            .group
            .on_acknowledgment(peer_id, writer_id, &mut buf)
    }

    /// Run a closure against the locked engine; mainly for embedders that
    /// need state not exposed through the forwarding methods.
    pub async fn with<T>(&self, f: impl FnOnce(&mut GroupMedia, &mut dyn GroupObserver) -> T) -> T {
        let inner = &mut *self.inner.lock().await;
        f(&mut inner.group, inner.sink.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::config::GroupMediaConfig;
    use crate::test_util::{RecordingObserver, TestBand};
    use bytes::Bytes;
    use tokio::runtime::Builder;

    #[test]
    fn test_manage_loop_gossips_to_peers() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        rt.block_on(async {
            let group = GroupMedia::new(
                "stream".to_string(),
                Bytes::from_static(b"key"),
                GroupMediaConfig::default_live(true),
                Instant::now(),
            );
            let driver = Arc::new(GroupMediaDriver::new(
                group,
                Box::new(RecordingObserver::default()),
            ));

            let band = TestBand::new(4096);
            let peer = PeerMedia::new(
                PeerId::from("peer-a"),
                Box::new(band.handle()),
                b"key",
            );
            driver.add_peer(peer).await;
            driver.on_media(MediaType::Video, 1000, b"frame").await;
            band.clear();

            let handle = {
                let driver = driver.clone();
                tokio::spawn(async move { driver.run().await })
            };
            tokio::time::sleep(Duration::from_millis(500)).await;
            handle.abort();

            // the tick loop announced our availability to the peer
            assert!(!band
                .frames_with_opcode(crate::wire::GROUP_FRAGMENTS_MAP)
                .is_empty());
        });
    }
}
