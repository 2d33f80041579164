// Communication channels lock-free
//
// Command queue: control → audio, result queue: audio → control. Both carry
// raw pointers to heap-allocated actions, so a transfer never allocates or
// frees on the audio thread. Ownership follows the pointer: whoever holds it
// (a queue slot, the executor, or the session after draining) is the only
// one allowed to touch the action. Pointers still queued when both ends are
// gone are freed by the queue itself, whichever end goes last.

use ringbuf::{HeapRb, traits::Split};

use crate::error::MixerResult;
use crate::messaging::action::Action;
use crate::messaging::notification::Notification;
use crate::ringbuffer::{RingBuffer, RingReader, RingWriter};

/// Pointer to an in-flight [`Action`]
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct ActionPtr(*mut Action);

impl Default for ActionPtr {
    fn default() -> Self {
        ActionPtr(std::ptr::null_mut())
    }
}

// SAFETY: an ActionPtr is only dereferenced by its current owner, and Action
// itself is Send.
unsafe impl Send for ActionPtr {}

impl ActionPtr {
    pub(crate) fn from_box(action: Box<Action>) -> Self {
        ActionPtr(Box::into_raw(action))
    }

    /// # Safety
    /// The pointer must come from [`ActionPtr::from_box`] and no other copy
    /// may be used afterwards.
    pub(crate) unsafe fn into_box(self) -> Box<Action> {
        debug_assert!(!self.0.is_null());
        // SAFETY: see above
        unsafe { Box::from_raw(self.0) }
    }

    /// # Safety
    /// Caller must currently own the action and hold no other reference to it.
    pub(crate) unsafe fn as_mut<'a>(self) -> &'a mut Action {
        // SAFETY: see above
        unsafe { &mut *self.0 }
    }
}

/// Producer side of an action queue
pub(crate) struct ActionSender {
    writer: RingWriter<ActionPtr>,
}

impl ActionSender {
    /// Hand an action over. Gives it back if the queue is full.
    pub(crate) fn send(&mut self, action: Box<Action>) -> Result<(), Box<Action>> {
        let ptr = ActionPtr::from_box(action);
        if self.send_ptr(ptr) {
            Ok(())
        } else {
            // SAFETY: the write failed, we still own the pointer
            Err(unsafe { ptr.into_box() })
        }
    }

    /// Real-time safe variant used by the executor
    #[inline]
    pub(crate) fn send_ptr(&mut self, ptr: ActionPtr) -> bool {
        self.writer.write(&[ptr]) == 1
    }

    #[cfg(test)]
    pub(crate) fn write_available(&self) -> usize {
        self.writer.write_available()
    }

    /// The receiving side has been dropped
    pub(crate) fn is_abandoned(&self) -> bool {
        self.writer.is_abandoned()
    }
}

/// Consumer side of an action queue
pub(crate) struct ActionReceiver {
    reader: RingReader<ActionPtr>,
}

impl ActionReceiver {
    /// Real-time safe variant used by the executor
    #[inline]
    pub(crate) fn recv_ptr(&mut self) -> Option<ActionPtr> {
        let mut slot = [ActionPtr::default()];
        if self.reader.read(&mut slot) == 1 {
            Some(slot[0])
        } else {
            None
        }
    }

    pub(crate) fn recv(&mut self) -> Option<Box<Action>> {
        // SAFETY: pointers in the queue come from ActionPtr::from_box and
        // the read transferred ownership to us
        self.recv_ptr().map(|ptr| unsafe { ptr.into_box() })
    }

    /// The sending side has been dropped
    pub(crate) fn is_abandoned(&self) -> bool {
        self.reader.is_abandoned()
    }
}

fn free_queued(ptr: &mut ActionPtr) {
    // SAFETY: an unread slot owns its action and the queue is going away
    drop(unsafe { ptr.into_box() });
}

/// Create an action queue. `capacity` must be a power of two.
pub(crate) fn create_action_queue(capacity: usize) -> MixerResult<(ActionSender, ActionReceiver)> {
    let (writer, reader) = RingBuffer::<ActionPtr>::with_drop_hook(capacity, free_queued)?.split();
    Ok((ActionSender { writer }, ActionReceiver { reader }))
}

pub type NotificationProducer = ringbuf::HeapProd<Notification>;
pub type NotificationConsumer = ringbuf::HeapCons<Notification>;

pub fn create_notification_channel(
    capacity: usize,
) -> (NotificationProducer, NotificationConsumer) {
    let rb = HeapRb::<Notification>::new(capacity);
    rb.split()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MixerError;
    use crate::messaging::action::{ActionHandle, Payload};
    use std::sync::Arc;

    fn cancel_action(id: u64) -> Box<Action> {
        Box::new(Action::new(
            ActionHandle(id),
            Payload::Cancel(ActionHandle(0)),
            Vec::new(),
            0,
            true,
        ))
    }

    #[test]
    fn test_queue_capacity_must_be_power_of_two() {
        assert!(matches!(
            create_action_queue(12),
            Err(MixerError::InvalidCapacity(12))
        ));
        assert!(create_action_queue(16).is_ok());
    }

    #[test]
    fn test_send_recv_preserves_order() {
        let (mut tx, mut rx) = create_action_queue(4).unwrap();
        for id in 1..=3 {
            tx.send(cancel_action(id)).unwrap();
        }
        for id in 1..=3 {
            assert_eq!(rx.recv().unwrap().handle(), ActionHandle(id));
        }
        assert!(rx.recv().is_none());
    }

    #[test]
    fn test_full_queue_gives_action_back() {
        let (mut tx, _rx) = create_action_queue(2).unwrap();
        tx.send(cancel_action(1)).unwrap();
        tx.send(cancel_action(2)).unwrap();
        assert_eq!(tx.write_available(), 0);

        let rejected = tx.send(cancel_action(3)).unwrap_err();
        assert_eq!(rejected.handle(), ActionHandle(3));
    }

    #[test]
    fn test_abandoned_receiver() {
        let (mut tx, rx) = create_action_queue(2).unwrap();
        tx.send(cancel_action(1)).unwrap();
        drop(rx);
        assert!(tx.is_abandoned());
    }

    fn play_action(id: u64, buffer: &Arc<[f32]>) -> Box<Action> {
        Box::new(Action::new(
            ActionHandle(id),
            Payload::PlayBuffer(Arc::clone(buffer)),
            vec![1],
            0,
            true,
        ))
    }

    #[test]
    fn test_queued_actions_freed_when_receiver_goes_first() {
        let buffer: Arc<[f32]> = vec![0.5f32; 8].into();
        let (mut tx, rx) = create_action_queue(4).unwrap();
        tx.send(play_action(1, &buffer)).unwrap();
        drop(rx);

        // The sender can still push after the receiver is gone
        assert!(tx.send(play_action(2, &buffer)).is_ok());
        assert_eq!(Arc::strong_count(&buffer), 3);

        drop(tx);
        assert_eq!(Arc::strong_count(&buffer), 1);
    }

    #[test]
    fn test_queued_actions_freed_when_sender_goes_first() {
        let buffer: Arc<[f32]> = vec![0.5f32; 8].into();
        let (mut tx, mut rx) = create_action_queue(4).unwrap();
        tx.send(play_action(1, &buffer)).unwrap();
        tx.send(play_action(2, &buffer)).unwrap();
        drop(tx);

        drop(rx.recv());
        assert_eq!(Arc::strong_count(&buffer), 2);
        drop(rx);
        assert_eq!(Arc::strong_count(&buffer), 1);
    }

    #[test]
    fn test_notification_channel() {
        use ringbuf::traits::{Consumer, Producer};

        let (mut tx, mut rx) = create_notification_channel(2);
        assert!(tx.try_push(Notification::info("one".to_string())).is_ok());
        assert!(tx.try_push(Notification::info("two".to_string())).is_ok());
        assert!(tx.try_push(Notification::info("three".to_string())).is_err());
        assert_eq!(rx.try_pop().unwrap().message, "one");
    }
}
