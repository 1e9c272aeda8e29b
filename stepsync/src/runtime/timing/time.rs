//! Minimal time units and strongly-typed durations/instants.
use core::marker::PhantomData;

/// Marker trait for a time unit.
pub trait TimeUnit {
    /// Human-readable name for debugging.
    const NAME: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Millis {}
impl TimeUnit for Millis {
    const NAME: &'static str = "ms";
}

/// Strongly-typed duration in a given unit.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Duration<U: TimeUnit>(u64, PhantomData<U>);

/// Strongly-typed monotonic instant in a given unit, relative to a clock origin.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MonoInstant<U: TimeUnit>(u64, PhantomData<U>);

// Manual Copy/Clone: derive would require U: Copy, but U is only a marker.
impl<U: TimeUnit> Copy for Duration<U> {}
impl<U: TimeUnit> Clone for Duration<U> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<U: TimeUnit> Copy for MonoInstant<U> {}
impl<U: TimeUnit> Clone for MonoInstant<U> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<U: TimeUnit> Duration<U> {
    pub const ZERO: Self = Self::new(0);

    /// Create a new duration.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    /// Return the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Duration<Millis> {
    /// Convenience constructor for milliseconds.
    #[inline]
    #[must_use]
    pub const fn from_millis(value: u64) -> Self {
        Self::new(value)
    }

    /// Converts from [`std::time::Duration`], truncating sub-millisecond
    /// precision and saturating at `u64::MAX`.
    #[must_use]
    pub fn from_std(d: std::time::Duration) -> Self {
        Self::new(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    /// Converts to [`std::time::Duration`].
    #[must_use]
    pub const fn to_std(self) -> std::time::Duration {
        std::time::Duration::from_millis(self.0)
    }
}

impl<U: TimeUnit> MonoInstant<U> {
    /// Create a new instant.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value, PhantomData)
    }

    /// Return the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    #[inline]
    #[must_use]
    pub const fn saturating_since(self, earlier: Self) -> Duration<U> {
        Duration::new(self.0.saturating_sub(earlier.0))
    }
}

impl<U: TimeUnit> core::ops::Add<Duration<U>> for MonoInstant<U> {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Duration<U>) -> Self::Output {
        Self::new(self.0 + rhs.0)
    }
}

impl<U: TimeUnit> core::ops::Sub for MonoInstant<U> {
    type Output = Duration<U>;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        Duration::new(self.0 - rhs.0)
    }
}

impl<U: TimeUnit> core::fmt::Display for Duration<U> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}{}", self.0, U::NAME)
    }
}
