//! Kernel state locking mechanism
//!
//! All kernel data structures are guarded by a single critical section
//! implemented by masking interrupts (the port's interrupt gate). This module
//! maps that gate onto the type system: mutable kernel state lives in
//! [`CpuLockCell`]s, which can only be accessed through a [`CpuLockToken`],
//! and the only way to obtain the token is to actually enter the critical
//! section with [`lock_cpu`].
use core::ops;
use tokenlock::UnsyncTokenLock;

use crate::{
    port,
    utils::Init,
};

pub(super) struct CpuLockTag {
    _nonexhaustive: (),
}

/// The key that "unlocks" [`CpuLockCell`].
pub(super) type CpuLockToken = tokenlock::UnsyncSingletonToken<CpuLockTag>;

/// The keyhole type for [`UnsyncTokenLock`] that can be "unlocked" by
/// [`CpuLockToken`].
pub(super) type CpuLockKeyhole = tokenlock::SingletonTokenId<CpuLockTag>;

/// Cell type that can be accessed by [`CpuLockToken`] (which can be obtained
/// by [`lock_cpu`]).
pub(super) struct CpuLockCell<T: ?Sized>(UnsyncTokenLock<T, CpuLockKeyhole>);

impl<T> CpuLockCell<T> {
    pub(super) const fn new(x: T) -> Self {
        Self(UnsyncTokenLock::new(CpuLockKeyhole::new(), x))
    }
}

impl<T: Init> Init for CpuLockCell<T> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new(T::INIT);
}

impl<T> ops::Deref for CpuLockCell<T> {
    type Target = UnsyncTokenLock<T, CpuLockKeyhole>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> ops::DerefMut for CpuLockCell<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Enter the critical section and get an RAII guard.
///
/// The port's interrupt gate is nestable, but the kernel itself never nests
/// critical sections: every kernel entry point acquires the guard exactly once
/// and passes [`CpuLockTokenRefMut`] down the call tree.
pub(super) fn lock_cpu() -> CpuLockGuard {
    let saved = (port::port().interrupt_disable)();

    // Safety: Interrupts are now masked on this single-CPU system and kernel
    // code acquires the guard exactly once per entry point, so no other
    // accessible instance of `CpuLockToken` exists. Tokens held by threads
    // that are suspended mid-switch are not accessible until those threads are
    // resumed, at which point this one is gone.
    CpuLockGuard {
        token: unsafe { CpuLockToken::new_unchecked() },
        saved,
    }
}

/// RAII guard for the critical section.
///
/// [`CpuLockToken`] can be borrowed from this type.
pub(super) struct CpuLockGuard {
    token: CpuLockToken,
    saved: port::IrqState,
}

impl CpuLockGuard {
    /// Construct a [`CpuLockTokenRefMut`] by borrowing `self`.
    pub(super) fn borrow_mut(&mut self) -> CpuLockTokenRefMut<'_> {
        self.token.borrow_mut()
    }
}

impl Drop for CpuLockGuard {
    fn drop(&mut self) {
        // Safety: the guard was constructed with the mask state returned by
        // the matching `interrupt_disable` call
        (port::port().interrupt_enable)(self.saved);
    }
}

impl ops::Deref for CpuLockGuard {
    type Target = CpuLockToken;
    fn deref(&self) -> &Self::Target {
        &self.token
    }
}

impl ops::DerefMut for CpuLockGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.token
    }
}

/// Borrowed version of [`CpuLockGuard`]. This is equivalent to
/// `&'a mut CpuLockGuard` but does not consume memory.
///
///  - Always prefer this over `&mut CpuLockGuard` in function parameters.
///  - When you pass `&'a mut _` to a function, the compiler automatically
///    reborrows it as `&'b mut _` so that the original `&'a mut _` remains
///    accessible after the function call. This does not happen with
///    `CpuLockTokenRefMut`. You have to call [`borrow_mut`] manually.
///
/// [`borrow_mut`]: tokenlock::UnsyncSingletonTokenRefMut::borrow_mut
pub(super) type CpuLockTokenRefMut<'a> = tokenlock::UnsyncSingletonTokenRefMut<'a, CpuLockTag>;

#[cfg(test)]
pub(crate) mod tests_util {
    use super::*;

    /// Materialize a `CpuLockToken` for unit tests that exercise token-gated
    /// data structures without going through a port.
    ///
    /// # Safety
    ///
    /// The caller must ensure the token is only used on data that no other
    /// test can reach (tests run concurrently in one process).
    pub(crate) unsafe fn fabricate_token() -> CpuLockToken {
        unsafe { CpuLockToken::new_unchecked() }
    }
}
