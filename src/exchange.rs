//! The buffer exchange protocol.
//!
//! A publisher fills the buffer at `write` without any lock, then swaps
//! `write` with `available` and raises `new_data` under the lock. A consumer
//! checks `new_data` without the lock and, if it is set, swaps `read` with
//! `available` and clears the flag under the lock. Only indices move; payload
//! bytes are never copied between buffers, so every buffer is owned by
//! exactly one side at any instant.

use crate::buffer_set::BufferSet;
use crate::error::ExchangeError;
use crate::image::{Role, SharedImage};
use crate::layout::{Direction, Side, Slot};
use crate::region::Region;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    /// The other side had consumed everything published before.
    Fresh,
    /// The previous publish had not been consumed yet and is now lost.
    ReplacedUnconsumed,
}

/// Swaps `write` and `available` and raises `new_data`.
pub(crate) fn publish_swap(set: &BufferSet, backoff: Duration) -> Published {
    let _guard = set.lock(backoff).acquire();
    let write = set.write.load(Ordering::Relaxed);
    let available = set.available.load(Ordering::Relaxed);
    set.write.store(available, Ordering::Relaxed);
    set.available.store(write, Ordering::Relaxed);
    if set.new_data.swap(1, Ordering::Relaxed) != 0 {
        Published::ReplacedUnconsumed
    } else {
        Published::Fresh
    }
}

/// Swaps `read` and `available` and clears `new_data`, if it is set.
///
/// Returns `false` without touching the lock or the indices if there is
/// nothing new.
pub(crate) fn consume_swap(set: &BufferSet, backoff: Duration) -> bool {
    if !set.has_new_data() {
        return false;
    }
    let _guard = set.lock(backoff).acquire();
    let read = set.read.load(Ordering::Relaxed);
    let available = set.available.load(Ordering::Relaxed);
    set.read.store(available, Ordering::Relaxed);
    set.available.store(read, Ordering::Relaxed);
    set.new_data.store(0, Ordering::Relaxed);
    true
}

/// Turns an index byte read from shared memory into a slot.
///
/// Indices are checked when the region is opened and afterwards only move by
/// swapping, so a byte that names no buffer means the peer broke the
/// protocol. No buffer is touched through it.
fn checked_slot(direction: Direction, slot: Result<Slot, u8>) -> Result<Slot, ExchangeError> {
    slot.map_err(|index| {
        log::error!("{:?} buffer set holds invalid index {}", direction, index);
        ExchangeError::CorruptIndex { direction, index }
    })
}

/// Writing end of one buffer set.
///
/// Owns the buffer at `write` between publishes. There is at most one
/// publisher per direction in the process.
#[derive(Debug)]
pub struct Publisher<R: Region> {
    image: Arc<SharedImage<R>>,
    direction: Direction,
}

impl<R: Region> Publisher<R> {
    pub fn new(image: Arc<SharedImage<R>>, direction: Direction) -> Result<Self, ExchangeError> {
        if !image.claim(direction, Role::Publisher) {
            return Err(ExchangeError::AlreadyClaimed {
                direction,
                role: "publisher",
            });
        }
        Ok(Self { image, direction })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Payload region of the current write buffer.
    ///
    /// Contents are whatever was last in that buffer; it is scratch memory
    /// until filled.
    #[inline(always)]
    pub fn buffer_mut(&mut self) -> Result<&mut [u8], ExchangeError> {
        let slot = checked_slot(
            self.direction,
            self.image.buffer_set(self.direction).write_slot(),
        )?;
        Ok(unsafe { self.image.payload_mut(self.direction, slot) })
    }

    /// Hands the write buffer to the other side.
    #[inline]
    pub fn commit(&mut self) -> Published {
        let published = publish_swap(self.image.buffer_set(self.direction), self.image.backoff());
        if published == Published::ReplacedUnconsumed {
            log::trace!("{:?}: previous payload was never consumed", self.direction);
        }
        published
    }

    /// Fills the write buffer in place and publishes it.
    #[inline]
    pub fn publish_with<F>(&mut self, fill: F) -> Result<Published, ExchangeError>
    where
        F: FnOnce(&mut [u8]),
    {
        fill(self.buffer_mut()?);
        Ok(self.commit())
    }

    /// Copies `payload` into the write buffer, zeroes the rest of the payload
    /// region and publishes it.
    pub fn publish(&mut self, payload: &[u8]) -> Result<Published, ExchangeError> {
        let capacity = self.image.layout().payload_size();
        if payload.len() > capacity {
            return Err(ExchangeError::PayloadTooLarge {
                len: payload.len(),
                capacity,
            });
        }
        self.publish_with(|buf| {
            let (head, tail) = buf.split_at_mut(payload.len());
            head.copy_from_slice(payload);
            tail.fill(0);
        })
    }
}

impl<R: Region> Drop for Publisher<R> {
    fn drop(&mut self) {
        self.image.unclaim(self.direction, Role::Publisher);
    }
}

/// Reading end of one buffer set.
///
/// Owns the buffer at `read`; its contents stay stable until the next
/// successful [`Consumer::try_consume`].
#[derive(Debug)]
pub struct Consumer<R: Region> {
    image: Arc<SharedImage<R>>,
    direction: Direction,
}

impl<R: Region> Consumer<R> {
    pub fn new(image: Arc<SharedImage<R>>, direction: Direction) -> Result<Self, ExchangeError> {
        if !image.claim(direction, Role::Consumer) {
            return Err(ExchangeError::AlreadyClaimed {
                direction,
                role: "consumer",
            });
        }
        Ok(Self { image, direction })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Unlocked check of the new-data flag.
    #[inline(always)]
    pub fn has_new_data(&self) -> bool {
        self.image.buffer_set(self.direction).has_new_data()
    }

    /// Claims the freshest payload, if the other side published since the
    /// last call.
    ///
    /// Returns `None`, leaving the indices untouched, when there is nothing
    /// new.
    #[inline]
    pub fn try_consume(&mut self) -> Result<Option<&[u8]>, ExchangeError> {
        if consume_swap(self.image.buffer_set(self.direction), self.image.backoff()) {
            self.current().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Payload of the buffer currently held at `read`.
    #[inline(always)]
    pub fn current(&self) -> Result<&[u8], ExchangeError> {
        let slot = checked_slot(
            self.direction,
            self.image.buffer_set(self.direction).read_slot(),
        )?;
        Ok(unsafe { self.image.payload(self.direction, slot) })
    }
}

impl<R: Region> Drop for Consumer<R> {
    fn drop(&mut self) {
        self.image.unclaim(self.direction, Role::Consumer);
    }
}

/// Both endpoints of one side of the exchange.
///
/// ```ignore
/// let image = Arc::new(SharedImage::open(region, layout, lock)?);
/// let mut io = Exchange::new(image, Side::Controller)?;
/// io.publish(Direction::Output, &[1, 2, 3])?;
/// if let Some(input) = io.try_consume(Direction::Input)? {
///     // ...
/// }
/// ```
#[derive(Debug)]
pub struct Exchange<R: Region> {
    side: Side,
    publisher: Publisher<R>,
    consumer: Consumer<R>,
}

impl<R: Region> Exchange<R> {
    pub fn new(image: Arc<SharedImage<R>>, side: Side) -> Result<Self, ExchangeError> {
        let publisher = Publisher::new(image.clone(), side.publishes())?;
        let consumer = Consumer::new(image, side.consumes())?;
        Ok(Self {
            side,
            publisher,
            consumer,
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn image(&self) -> &SharedImage<R> {
        &self.publisher.image
    }

    /// Separate borrows of both endpoints, so the input can be read while
    /// the output is written.
    pub fn split(&mut self) -> (&mut Publisher<R>, &mut Consumer<R>) {
        (&mut self.publisher, &mut self.consumer)
    }

    pub fn into_parts(self) -> (Publisher<R>, Consumer<R>) {
        (self.publisher, self.consumer)
    }

    fn publisher_for(&mut self, direction: Direction) -> Result<&mut Publisher<R>, ExchangeError> {
        if direction == self.publisher.direction {
            Ok(&mut self.publisher)
        } else {
            Err(ExchangeError::WrongDirection {
                direction,
                op: "publish",
            })
        }
    }

    fn consumer_for(&self, direction: Direction) -> Result<&Consumer<R>, ExchangeError> {
        if direction == self.consumer.direction {
            Ok(&self.consumer)
        } else {
            Err(ExchangeError::WrongDirection {
                direction,
                op: "consume",
            })
        }
    }

    pub fn publish(
        &mut self,
        direction: Direction,
        payload: &[u8],
    ) -> Result<Published, ExchangeError> {
        self.publisher_for(direction)?.publish(payload)
    }

    pub fn publish_with<F: FnOnce(&mut [u8])>(
        &mut self,
        direction: Direction,
        fill: F,
    ) -> Result<Published, ExchangeError> {
        self.publisher_for(direction)?.publish_with(fill)
    }

    pub fn try_consume(&mut self, direction: Direction) -> Result<Option<&[u8]>, ExchangeError> {
        self.consumer_for(direction)?;
        self.consumer.try_consume()
    }

    pub fn current(&self, direction: Direction) -> Result<&[u8], ExchangeError> {
        self.consumer_for(direction)?.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::tests::formatted;
    use crate::region::HeapRegion;
    use proptest::prelude::*;

    type Image = Arc<SharedImage<HeapRegion>>;

    fn pair() -> (Image, Exchange<HeapRegion>, Exchange<HeapRegion>) {
        let image = Arc::new(formatted());
        let controller = Exchange::new(image.clone(), Side::Controller).unwrap();
        let device = Exchange::new(image.clone(), Side::Device).unwrap();
        (image, controller, device)
    }

    #[test]
    fn publish_then_consume_roundtrip() {
        let (_image, mut ctl, mut dev) = pair();

        assert_eq!(ctl.publish(Direction::Output, b"hello").unwrap(), Published::Fresh);
        let got = dev.try_consume(Direction::Output).unwrap().expect("new data");
        assert_eq!(&got[..5], b"hello");
        assert!(got[5..].iter().all(|&b| b == 0));
        assert_eq!(got.len(), 1024);

        dev.publish_with(Direction::Input, |buf| buf[..3].copy_from_slice(&[7, 8, 9]))
            .unwrap();
        let got = ctl.try_consume(Direction::Input).unwrap().expect("new data");
        assert_eq!(&got[..3], &[7, 8, 9]);
    }

    #[test]
    fn consume_without_new_data_is_a_noop() {
        let (image, mut ctl, _dev) = pair();
        let set = image.buffer_set(Direction::Input);
        let before = set.indices();

        assert!(ctl.try_consume(Direction::Input).unwrap().is_none());
        assert_eq!(set.indices(), before);
        assert!(!set.has_new_data());
    }

    #[test]
    fn publish_swaps_write_and_available() {
        let (image, mut ctl, _dev) = pair();
        let set = image.buffer_set(Direction::Output);
        assert_eq!(set.indices().as_array(), [0, 1, 2]);

        ctl.publish(Direction::Output, &[1]).unwrap();
        let idx = set.indices();
        assert_eq!((idx.read, idx.write, idx.available), (0, 2, 1));
        assert!(set.has_new_data());
        assert!(!set.lock(Duration::ZERO).is_locked());
    }

    #[test]
    fn consume_swaps_read_and_available() {
        let (image, mut ctl, mut dev) = pair();
        let set = image.buffer_set(Direction::Input);

        dev.publish(Direction::Input, &[1]).unwrap();
        assert!(ctl.try_consume(Direction::Input).unwrap().is_some());
        let idx = set.indices();
        assert_eq!((idx.read, idx.write, idx.available), (1, 2, 0));
        assert!(!set.has_new_data());
    }

    #[test]
    fn two_publishes_last_writer_wins() {
        let (_image, mut ctl, mut dev) = pair();

        assert_eq!(ctl.publish(Direction::Output, &[1]).unwrap(), Published::Fresh);
        assert_eq!(
            ctl.publish(Direction::Output, &[2]).unwrap(),
            Published::ReplacedUnconsumed
        );

        let got = dev.try_consume(Direction::Output).unwrap().unwrap();
        assert_eq!(got[0], 2);
        assert!(dev.try_consume(Direction::Output).unwrap().is_none());
    }

    #[test]
    fn read_buffer_stays_stable_until_next_consume() {
        let (_image, mut ctl, mut dev) = pair();

        dev.publish(Direction::Input, &[10]).unwrap();
        ctl.try_consume(Direction::Input).unwrap();
        // The device keeps publishing; what we hold must not change.
        for v in 11..20 {
            dev.publish(Direction::Input, &[v]).unwrap();
            assert_eq!(ctl.current(Direction::Input).unwrap()[0], 10);
        }
        assert_eq!(ctl.try_consume(Direction::Input).unwrap().unwrap()[0], 19);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (image, mut ctl, _dev) = pair();
        let before = image.buffer_set(Direction::Output).indices();
        let too_big = vec![0u8; 1025];
        assert_eq!(
            ctl.publish(Direction::Output, &too_big),
            Err(ExchangeError::PayloadTooLarge {
                len: 1025,
                capacity: 1024
            })
        );
        assert_eq!(image.buffer_set(Direction::Output).indices(), before);
        assert!(ctl.publish(Direction::Output, &too_big[..1024]).is_ok());
    }

    #[test]
    fn wrong_direction_is_rejected() {
        let (_image, mut ctl, mut dev) = pair();
        assert!(matches!(
            ctl.publish(Direction::Input, &[1]),
            Err(ExchangeError::WrongDirection {
                direction: Direction::Input,
                ..
            })
        ));
        assert!(matches!(
            ctl.try_consume(Direction::Output),
            Err(ExchangeError::WrongDirection { .. })
        ));
        assert!(matches!(
            dev.current(Direction::Input),
            Err(ExchangeError::WrongDirection { .. })
        ));
    }

    #[test]
    fn endpoints_are_unique_per_direction() {
        let (image, ctl, _dev) = pair();
        assert!(matches!(
            Exchange::new(image.clone(), Side::Controller),
            Err(ExchangeError::AlreadyClaimed { .. })
        ));
        drop(ctl);
        assert!(Exchange::new(image, Side::Controller).is_ok());
    }

    #[test]
    fn publish_stamps_payload_offset() {
        let (image, mut ctl, _dev) = pair();
        let (tx, _) = ctl.split();
        // Scribble over the header of the write buffer, then publish.
        let slot = image.buffer_set(Direction::Output).write_slot().unwrap();
        let off = image.layout().buffer_offset(Direction::Output, slot);
        unsafe { image.region().base().as_ptr().add(off).write_bytes(0xFF, 2) };
        tx.publish(&[42]).unwrap();
        let bytes =
            unsafe { std::slice::from_raw_parts(image.region().base().as_ptr().add(off), 2) };
        assert_eq!(u16::from_ne_bytes([bytes[0], bytes[1]]), 16);
    }

    #[test]
    fn out_of_range_index_is_reported_not_followed() {
        let (image, mut ctl, mut dev) = pair();
        let input = image.buffer_set(Direction::Input);
        input.read.store(3, Ordering::Relaxed);

        assert_eq!(
            ctl.current(Direction::Input),
            Err(ExchangeError::CorruptIndex {
                direction: Direction::Input,
                index: 3
            })
        );

        // A bad byte that arrives through a swap is reported as well.
        input.read.store(0, Ordering::Relaxed);
        dev.publish(Direction::Input, &[1]).unwrap();
        input.available.store(9, Ordering::Relaxed);
        assert_eq!(
            ctl.try_consume(Direction::Input),
            Err(ExchangeError::CorruptIndex {
                direction: Direction::Input,
                index: 9
            })
        );

        // The publisher refuses to write through a bad index and leaves the
        // set alone.
        let output = image.buffer_set(Direction::Output);
        output.write.store(200, Ordering::Relaxed);
        let before = output.indices();
        assert!(matches!(
            ctl.publish(Direction::Output, &[1]),
            Err(ExchangeError::CorruptIndex { index: 200, .. })
        ));
        assert_eq!(output.indices(), before);
        assert!(!output.has_new_data());
    }

    #[derive(Debug, Clone)]
    enum Op {
        ControllerPublish(u8),
        ControllerConsume,
        DevicePublish(u8),
        DeviceConsume,
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u8>().prop_map(Op::ControllerPublish),
            Just(Op::ControllerConsume),
            any::<u8>().prop_map(Op::DevicePublish),
            Just(Op::DeviceConsume),
        ]
    }

    proptest! {
        #[test]
        fn indices_stay_a_permutation(ops in proptest::collection::vec(arb_op(), 0..64)) {
            let (image, mut ctl, mut dev) = pair();
            // Latest unconsumed value per direction, and what each reader holds.
            let mut pending_out: Option<u8> = None;
            let mut pending_in: Option<u8> = None;

            for op in ops {
                match op {
                    Op::ControllerPublish(v) => {
                        ctl.publish(Direction::Output, &[v]).unwrap();
                        pending_out = Some(v);
                    }
                    Op::DevicePublish(v) => {
                        dev.publish(Direction::Input, &[v]).unwrap();
                        pending_in = Some(v);
                    }
                    Op::DeviceConsume => {
                        let got = dev.try_consume(Direction::Output).unwrap().map(|p| p[0]);
                        prop_assert_eq!(got, pending_out.take());
                    }
                    Op::ControllerConsume => {
                        let got = ctl.try_consume(Direction::Input).unwrap().map(|p| p[0]);
                        prop_assert_eq!(got, pending_in.take());
                    }
                }
                for direction in Direction::ALL {
                    let set = image.buffer_set(direction);
                    prop_assert!(set.indices().is_permutation(), "{:?}", set);
                }
            }
        }
    }

    /// Both sides hammer both directions from their own threads. Every
    /// payload is a sequence number repeated across the whole buffer, so a
    /// buffer written while the reader held it would show mixed values.
    #[test]
    fn concurrent_exchange_never_tears() {
        const ROUNDS: u64 = 20_000;

        fn fill(buf: &mut [u8], seq: u64) {
            for chunk in buf.chunks_exact_mut(8) {
                chunk.copy_from_slice(&seq.to_ne_bytes());
            }
        }

        fn check(buf: &[u8], last: &mut u64) {
            let seq = u64::from_ne_bytes(buf[..8].try_into().unwrap());
            for chunk in buf.chunks_exact(8) {
                assert_eq!(u64::from_ne_bytes(chunk.try_into().unwrap()), seq, "torn buffer");
            }
            assert!(seq > *last, "went backwards: {} after {}", seq, last);
            *last = seq;
        }

        let image = Arc::new(formatted());
        let side = |side: Side| {
            let image = image.clone();
            std::thread::spawn(move || {
                let mut io = Exchange::new(image.clone(), side).unwrap();
                let (tx, rx) = io.split();
                let mut last = 0u64;
                let mut received = 0u64;
                for seq in 1..=ROUNDS {
                    tx.publish_with(|buf| fill(buf, seq)).unwrap();
                    if let Some(buf) = rx.try_consume().unwrap() {
                        check(buf, &mut last);
                        received += 1;
                    }
                    for direction in Direction::ALL {
                        let set = image.buffer_set(direction);
                        let _guard = set.lock(Duration::from_micros(1)).acquire();
                        assert!(set.indices().is_permutation());
                    }
                }
                received
            })
        };

        let ctl = side(Side::Controller);
        let dev = side(Side::Device);
        let got_in = ctl.join().unwrap();
        let got_out = dev.join().unwrap();
        assert!(got_in > 0 && got_out > 0);
    }
}
