//! GOP replay buffer
//!
//! The transcoder attaches to the relay after the publisher has been
//! sending for a while. Feeding it only the live stream would leave its
//! decoder waiting out the rest of the current GOP; instead the relay
//! keeps every video frame since the latest keyframe and replays that
//! prefix to each new subscriber.
//!
//! Two rules keep the buffer honest. Frames that arrive before any
//! keyframe are not kept: a replay that cannot start at a keyframe is
//! worthless to a decoder. And a GOP that outgrows the byte budget is
//! dropped whole for the same reason; the buffer then stays empty until
//! the encoder delivers its next keyframe.

use super::flv::FlvTag;

/// The current GOP, keyframe first, bounded by bytes
#[derive(Debug)]
pub struct GopBuffer {
    /// Byte budget for the buffered GOP
    cap: usize,
    /// Bytes currently buffered
    used: usize,
    /// Keyframe, then every frame after it in arrival order. Either
    /// empty or anchored: the first element is always a keyframe.
    tags: Vec<FlvTag>,
}

impl GopBuffer {
    /// Default byte budget: 4 MB
    pub fn new() -> Self {
        Self::with_max_size(4 * 1024 * 1024)
    }

    pub fn with_max_size(cap: usize) -> Self {
        Self {
            cap,
            used: 0,
            tags: Vec::new(),
        }
    }

    /// Offer a frame; returns whether it was kept.
    ///
    /// A keyframe begins a fresh GOP. Anything else is kept only while a
    /// keyframe anchors the buffer and the byte budget holds.
    pub fn push(&mut self, tag: FlvTag) -> bool {
        if tag.is_keyframe() {
            self.clear();
        } else if self.tags.is_empty() {
            return false;
        }

        let size = tag.size();
        if self.used + size > self.cap {
            self.clear();
            return false;
        }

        self.used += size;
        self.tags.push(tag);
        true
    }

    /// Whether a replay would start at a keyframe
    pub fn is_anchored(&self) -> bool {
        !self.tags.is_empty()
    }

    /// The buffered GOP, oldest first
    pub fn replay(&self) -> Vec<FlvTag> {
        self.tags.clone()
    }

    /// Number of buffered frames
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Bytes currently buffered
    pub fn byte_size(&self) -> usize {
        self.used
    }

    /// Drop the buffered GOP
    pub fn clear(&mut self) {
        self.tags.clear();
        self.used = 0;
    }
}

impl Default for GopBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(timestamp: u32, keyframe: bool, size: usize) -> FlvTag {
        let mut data = vec![0u8; size.max(2)];
        data[0] = if keyframe { 0x17 } else { 0x27 };
        data[1] = 0x01;
        FlvTag::video(timestamp, Bytes::from(data))
    }

    #[test]
    fn test_nothing_kept_before_first_keyframe() {
        let mut buffer = GopBuffer::new();

        assert!(!buffer.push(frame(0, false, 100)));
        assert!(!buffer.push(frame(33, false, 100)));
        assert!(buffer.is_empty());
        assert!(!buffer.is_anchored());
    }

    #[test]
    fn test_keyframe_anchors_the_buffer() {
        let mut buffer = GopBuffer::new();

        assert!(buffer.push(frame(0, true, 500)));
        assert!(buffer.is_anchored());

        assert!(buffer.push(frame(33, false, 200)));
        assert!(buffer.push(frame(66, false, 200)));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.byte_size(), 900);
    }

    #[test]
    fn test_new_keyframe_starts_over() {
        let mut buffer = GopBuffer::new();

        buffer.push(frame(0, true, 500));
        buffer.push(frame(33, false, 200));
        buffer.push(frame(66, false, 200));

        buffer.push(frame(100, true, 500));
        assert_eq!(buffer.len(), 1);
        assert!(buffer.is_anchored());
        assert_eq!(buffer.byte_size(), 500);
    }

    #[test]
    fn test_overflow_drops_the_whole_gop() {
        let mut buffer = GopBuffer::with_max_size(500);

        buffer.push(frame(0, true, 200));
        buffer.push(frame(33, false, 200));

        // This frame would blow the budget; the replay is now useless
        // as a whole, so nothing survives
        assert!(!buffer.push(frame(66, false, 200)));
        assert!(buffer.is_empty());
        assert_eq!(buffer.byte_size(), 0);

        // Still nothing to anchor on until the next keyframe
        assert!(!buffer.push(frame(100, false, 50)));
        assert!(buffer.push(frame(133, true, 50)));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_keyframe_over_budget_rejected() {
        let mut buffer = GopBuffer::with_max_size(500);

        assert!(!buffer.push(frame(0, true, 600)));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_replay_order() {
        let mut buffer = GopBuffer::new();

        buffer.push(frame(0, true, 100));
        buffer.push(frame(33, false, 50));
        buffer.push(frame(66, false, 50));

        let replay = buffer.replay();
        assert_eq!(replay.len(), 3);
        assert!(replay[0].is_keyframe());
        assert_eq!(replay[1].timestamp, 33);
        assert_eq!(replay[2].timestamp, 66);
    }

    #[test]
    fn test_clear() {
        let mut buffer = GopBuffer::new();
        buffer.push(frame(0, true, 100));

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.byte_size(), 0);
        assert!(!buffer.is_anchored());
    }

    #[test]
    fn test_default_buffer() {
        let buffer = GopBuffer::default();
        assert!(buffer.is_empty());
        assert!(buffer.replay().is_empty());
    }
}
