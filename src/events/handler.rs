//! Subscriber callbacks.

use super::envelope::Envelope;

/// Receives payloads of type `P` delivered on a lane.
///
/// Handlers always run on the thread that owns the lane, one at a time, so an
/// implementation never needs its own locking.
pub trait Handler<P>: Send {
    /// Handle one message.
    fn handle(&mut self, envelope: &Envelope, payload: &P);
}

/// Adapter letting a plain closure act as a [`Handler`].
pub(crate) struct FnHandler<F>(pub(crate) F);

impl<P, F> Handler<P> for FnHandler<F>
where
    F: FnMut(&Envelope, &P) + Send,
{
    #[inline]
    fn handle(&mut self, envelope: &Envelope, payload: &P) {
        (self.0)(envelope, payload)
    }
}
