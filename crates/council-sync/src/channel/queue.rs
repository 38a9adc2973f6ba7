use std::collections::VecDeque;

use bytes::Bytes;

/// FIFO buffer of bodies waiting for a connection.
///
/// Items are only removed once the transmit callback accepted them, so a
/// failure mid-flush leaves the failed item at the head. There is no
/// capacity limit: nothing is dropped except by [`OutboundQueue::clear`].
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: VecDeque<Pending>,
    next_seq: u64,
    delivered_through: Option<u64>,
}

#[derive(Debug)]
struct Pending {
    seq: u64,
    body: Bytes,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the tail and returns the item's sequence number.
    pub fn enqueue(&mut self, body: Bytes) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.push_back(Pending { seq, body });
        seq
    }

    /// Transmits from the head until empty or until `transmit` fails.
    /// Returns how many items went out before the failure, if any.
    pub fn flush<E, F>(&mut self, mut transmit: F) -> Result<usize, (usize, E)>
    where
        F: FnMut(&Bytes) -> Result<(), E>,
    {
        let mut sent = 0;
        while let Some(front) = self.items.front() {
            if let Err(err) = transmit(&front.body) {
                return Err((sent, err));
            }
            let seq = front.seq;
            self.items.pop_front();
            self.delivered_through = Some(seq);
            sent += 1;
        }
        Ok(sent)
    }

    pub fn is_delivered(&self, seq: u64) -> bool {
        self.delivered_through.is_some_and(|through| seq <= through)
    }

    pub fn is_pending(&self, seq: u64) -> bool {
        self.items.iter().any(|item| item.seq == seq)
    }

    /// Discards every pending item and returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn pending(&self) -> Vec<Bytes> {
        self.items.iter().map(|item| item.body.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn flushes_in_fifo_order() {
        let mut queue = OutboundQueue::new();
        let a = queue.enqueue(body("m1"));
        let b = queue.enqueue(body("m2"));
        let mut out = Vec::new();
        let sent = queue
            .flush(|b| {
                out.push(b.clone());
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(sent, 2);
        assert_eq!(out, vec![body("m1"), body("m2")]);
        assert!(queue.is_empty());
        assert!(queue.is_delivered(a));
        assert!(queue.is_delivered(b));
    }

    #[test]
    fn failure_mid_flush_preserves_remaining_items() {
        let mut queue = OutboundQueue::new();
        queue.enqueue(body("m1"));
        let second = queue.enqueue(body("m2"));
        queue.enqueue(body("m3"));

        let mut calls = 0;
        let result = queue.flush(|_| {
            calls += 1;
            if calls == 2 {
                Err("socket dropped")
            } else {
                Ok(())
            }
        });
        assert_eq!(result, Err((1, "socket dropped")));
        assert_eq!(queue.pending(), vec![body("m2"), body("m3")]);
        assert!(queue.is_pending(second));
        assert!(!queue.is_delivered(second));

        let mut out = Vec::new();
        queue
            .flush(|b| {
                out.push(b.clone());
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(out, vec![body("m2"), body("m3")]);
    }

    #[test]
    fn clear_drops_everything_without_marking_delivery() {
        let mut queue = OutboundQueue::new();
        let seq = queue.enqueue(body("m1"));
        queue.enqueue(body("m2"));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert!(!queue.is_delivered(seq));
        assert!(!queue.is_pending(seq));
    }
}
