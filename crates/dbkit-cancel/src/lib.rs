use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, LazyLock, Weak,
    },
};

static NEVER_CANCELS_CTS: LazyLock<CancellationTokenSource> =
    LazyLock::new(CancellationTokenSource::new);

/// Marker error produced when a [`CancellationToken`] observes cancellation.
#[derive(Debug, Clone, Copy)]
pub struct CancelledError;

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl Error for CancelledError {}

/// Turns any error type `E` into a cancellable error type.
///
/// A function that returns `Result<T, Cancellable<E>>` can return
/// `Err(Cancellable::Cancelled)` to indicate that the operation was
/// cancelled rather than failed outright.
///
/// If `E` can represent the cancellation state, implement
/// `From<CancelledError> for E` and call [`Cancellable::flatten`] to collapse
/// `Cancellable<E>` back into `E`.
#[derive(Debug)]
pub enum Cancellable<E> {
    Cancelled,
    Error(E),
}

impl<E: From<CancelledError>> Cancellable<E> {
    /// Flatten `Cancellable<E>` into `E`, using `E`'s `From<CancelledError>` impl.
    pub fn flatten(self) -> E {
        match self {
            Cancellable::Cancelled => E::from(CancelledError),
            Cancellable::Error(e) => e,
        }
    }
}

impl<E> From<CancelledError> for Cancellable<E> {
    fn from(_: CancelledError) -> Self {
        Cancellable::Cancelled
    }
}

impl<E: Error> From<E> for Cancellable<E> {
    fn from(err: E) -> Self {
        Cancellable::Error(err)
    }
}

/// Inner shared state for a [`CancellationTokenSource`].
#[derive(Default, Debug)]
struct Inner {
    request_id: AtomicU64,
}

/// A source of cancellation tokens.
///
/// Tokens are issued with [`CancellationTokenSource::token`]. Calling
/// [`CancellationTokenSource::cancel`] cancels every token issued so far
/// (tokens issued afterwards start out uncancelled). Dropping the source
/// cancels every outstanding token as well.
///
/// ```rust
/// use dbkit_cancel::CancellationTokenSource;
///
/// let cts = CancellationTokenSource::new();
/// let token = cts.token();
/// assert!(!token.is_cancelled());
/// cts.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Clone, Default, Debug)]
pub struct CancellationTokenSource {
    inner: Arc<Inner>,
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        CancellationTokenSource {
            inner: Arc::new(Inner {
                request_id: AtomicU64::new(0),
            }),
        }
    }

    /// Issues a fresh, not-yet-cancelled token from this source.
    pub fn token(&self) -> CancellationToken {
        let request_id = self.inner.request_id.load(Ordering::Acquire);
        CancellationToken::new(Arc::downgrade(&self.inner), request_id)
    }

    /// Cancels every token issued from this source so far.
    #[inline]
    pub fn cancel(&self) {
        self.inner.request_id.fetch_add(1, Ordering::AcqRel);
    }
}

trait TokenLike: fmt::Debug + Send + Sync + 'static {
    fn is_cancelled(&self) -> bool;
    fn clone_box(&self) -> Box<dyn TokenLike>;
}

#[derive(Clone, Debug)]
struct SourceBackedToken {
    source: Weak<Inner>,
    request_id: u64,
}

impl TokenLike for SourceBackedToken {
    fn is_cancelled(&self) -> bool {
        match self.source.upgrade() {
            Some(source) => source.request_id.load(Ordering::Acquire) > self.request_id,
            // The CancellationTokenSource was dropped: treat that as cancellation.
            None => true,
        }
    }

    fn clone_box(&self) -> Box<dyn TokenLike> {
        Box::new(self.clone())
    }
}

/// Implementation backing [`CancellationToken::combine_with_flag`].
#[derive(Debug)]
struct FlagCombinedToken {
    inner: Box<dyn TokenLike>,
    flag: Arc<AtomicBool>,
}

impl Clone for FlagCombinedToken {
    fn clone(&self) -> Self {
        FlagCombinedToken {
            inner: self.inner.clone_box(),
            flag: Arc::clone(&self.flag),
        }
    }
}

impl TokenLike for FlagCombinedToken {
    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire) || self.inner.is_cancelled()
    }

    fn clone_box(&self) -> Box<dyn TokenLike> {
        Box::new(self.clone())
    }
}

/// A handle used to check whether an operation has been cancelled.
///
/// Cancellation is cooperative: nothing stops running code automatically.
/// Long-running work should call [`CancellationToken::check_cancellation`]
/// at natural suspension points (e.g. between commits in the observation
/// engine, or per morsel in a prefetch loop).
#[derive(Debug)]
pub struct CancellationToken {
    inner: Box<dyn TokenLike>,
}

impl Clone for CancellationToken {
    fn clone(&self) -> Self {
        CancellationToken {
            inner: self.inner.clone_box(),
        }
    }
}

impl CancellationToken {
    fn new(source: Weak<Inner>, request_id: u64) -> Self {
        Self {
            inner: Box::new(SourceBackedToken { source, request_id }),
        }
    }

    /// A token that never reports cancellation.
    ///
    /// Useful in tests, and as an escape hatch at call sites that haven't
    /// been threaded through with a real token yet.
    pub fn never_cancels() -> Self {
        NEVER_CANCELS_CTS.token()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Checks cancellation, returning `Err` if cancelled.
    ///
    /// `token.check_cancellation()?;` works in any function returning
    /// `Result<T, E>` where `E: From<CancelledError>`, `Result<T, Cancellable<E>>`,
    /// or `Result<T, CancelledError>`.
    #[inline]
    pub fn check_cancellation(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }

    /// Combines this token with an externally-controlled flag: the result is
    /// cancelled if either the original token is cancelled or the flag is set.
    pub fn combine_with_flag(self, flag: Arc<AtomicBool>) -> CancellationToken {
        CancellationToken {
            inner: Box::new(FlagCombinedToken {
                inner: self.inner,
                flag,
            }),
        }
    }
}

/// Shorthand for [`CancellationToken::never_cancels`].
pub fn never_cancels() -> CancellationToken {
    CancellationToken::never_cancels()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fmt, thread, time::Duration};

    #[derive(Debug)]
    struct MyError {
        cancelled: bool,
    }

    impl MyError {
        fn new() -> Self {
            MyError { cancelled: false }
        }
    }

    impl Error for MyError {}

    impl fmt::Display for MyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "MyError: cancelled={}", self.cancelled)
        }
    }

    impl From<Cancellable<MyError>> for MyError {
        fn from(value: Cancellable<MyError>) -> Self {
            match value {
                Cancellable::Cancelled => MyError::from(CancelledError),
                Cancellable::Error(e) => e,
            }
        }
    }

    impl From<CancelledError> for MyError {
        fn from(_: CancelledError) -> Self {
            MyError { cancelled: true }
        }
    }

    #[test]
    fn source_cancels_issued_tokens() {
        let cts = CancellationTokenSource::new();
        let token = cts.token();
        assert!(!token.is_cancelled());

        cts.cancel();
        assert!(token.is_cancelled());

        let new_token = cts.token();
        assert!(!new_token.is_cancelled());

        drop(cts);
        assert!(new_token.is_cancelled());
    }

    #[test]
    fn combine_with_flag_either_source_cancels() {
        let cts = CancellationTokenSource::new();
        let flag = Arc::new(AtomicBool::new(false));
        let token = cts.token().combine_with_flag(Arc::clone(&flag));
        assert!(!token.is_cancelled());

        flag.store(true, Ordering::Release);
        assert!(token.is_cancelled());

        flag.store(false, Ordering::Release);
        assert!(!token.is_cancelled());

        cts.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancellation_is_visible_across_threads() {
        let cts = CancellationTokenSource::new();
        let token = cts.token();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            cts.cancel();
        });
        assert!(!token.is_cancelled());
        while !token.is_cancelled() {
            thread::sleep(Duration::from_millis(10));
        }
        handle.join().unwrap();
    }

    fn fail() -> Result<(), MyError> {
        Err(MyError::new())
    }

    fn cancellable_fail() -> Result<(), Cancellable<MyError>> {
        fail()?;
        Err(MyError::new().into())
    }

    fn nocancel() -> Result<(), Cancellable<MyError>> {
        Ok(())
    }

    fn cancel() -> Result<(), Cancellable<MyError>> {
        Err(Cancellable::Cancelled)
    }

    fn fail_because_cancelled() -> Result<(), MyError> {
        nocancel()?;
        cancel()?;
        Ok(())
    }

    #[test]
    fn cancellable_conversions() {
        assert_eq!(
            format!("{:?}", cancellable_fail().unwrap_err()),
            "Error(MyError { cancelled: false })"
        );
        assert_eq!(format!("{:?}", cancel().unwrap_err()), "Cancelled");
        assert_eq!(
            format!("{}", fail_because_cancelled().unwrap_err()),
            "MyError: cancelled=true"
        );
    }

    #[test]
    #[should_panic]
    fn zero_is_not_a_valid_weak_upgrade_shortcut() {
        // CancellationTokenSource has no "invalid" construction to test directly;
        // this documents that `never_cancels()` must never report cancelled.
        assert!(CancellationToken::never_cancels().is_cancelled());
    }
}
