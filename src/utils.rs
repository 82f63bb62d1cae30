use std::any::Any;

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Wrapper asserting that a value may be sent to another thread.
///
/// Used to ship a task frame back to its affine loop for teardown: the frame
/// itself is only ever touched on that loop's thread, the wrapper merely
/// rides the injector queue to get there.
pub(crate) struct AssertSend<T>(pub(crate) T);

unsafe impl<T> Send for AssertSend<T> {}
