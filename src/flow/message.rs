use bytes::Bytes;
use std::collections::BTreeMap;

/// One message queued on a flow writer.
///
/// `Buffered` messages are reliable: they stay in the sent queue until every
/// fragment is acknowledged, and lost fragments are retransmitted.
/// `Unbuffered` messages are fire-and-forget: a reported loss only advances
/// the acknowledged stage.
///
/// Both variants carry the `offset -> stage` map that is populated as the
/// message is fragmented onto the wire: for each body offset at which a
/// fragment starts, the stage at which that fragment was most recently
/// transmitted.
#[derive(Debug)]
pub enum FlowMessage {
    Buffered {
        body: Bytes,
        fragments: BTreeMap<u32, u64>,
    },
    Unbuffered {
        body: Bytes,
        fragments: BTreeMap<u32, u64>,
    },
}

impl FlowMessage {
    pub fn buffered(body: Bytes) -> FlowMessage {
        FlowMessage::Buffered {
            body,
            fragments: BTreeMap::default(),
        }
    }

    pub fn unbuffered(body: Bytes) -> FlowMessage {
        FlowMessage::Unbuffered {
            body,
            fragments: BTreeMap::default(),
        }
    }

    pub fn repeatable(&self) -> bool {
        matches!(self, FlowMessage::Buffered { .. })
    }

    pub fn body(&self) -> Bytes {
        match self {
            FlowMessage::Buffered { body, .. } | FlowMessage::Unbuffered { body, .. } => {
                body.clone()
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FlowMessage::Buffered { body, .. } | FlowMessage::Unbuffered { body, .. } => body.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fragments(&self) -> &BTreeMap<u32, u64> {
        match self {
            FlowMessage::Buffered { fragments, .. } | FlowMessage::Unbuffered { fragments, .. } => {
                fragments
            }
        }
    }

    pub fn fragments_mut(&mut self) -> &mut BTreeMap<u32, u64> {
        match self {
            FlowMessage::Buffered { fragments, .. } | FlowMessage::Unbuffered { fragments, .. } => {
                fragments
            }
        }
    }
}
