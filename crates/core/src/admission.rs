/// Admission-control gate (rate limiter, concurrency limiter, ...).
///
/// The engine never consults it; callers check `allow()` before submitting.
///
/// ```
/// use kairos_core::Admission;
///
/// let open = || true;
/// assert!(open.allow());
/// ```
pub trait Admission: Send + Sync {
    fn allow(&self) -> bool;
}

impl<F> Admission for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn allow(&self) -> bool {
        self()
    }
}
