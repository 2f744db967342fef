//! The single lock guarding a pool's state.
//!
//! `Mutex<T, L>` is similar to `std::sync::Mutex<T>` but parameterized over any
//! type `L` that implements [`Lock`], so that the pool stays usable without
//! `std`.

use core::{
    cell::{Cell, UnsafeCell},
    ops::{Deref, DerefMut},
};

/// A trait for providing mutual exclusion over a pool's block lists, address
/// index, and counters.
///
/// Acquisition is unconditional: there is no try-lock or timeout, so a stalled
/// holder stalls every caller of that pool.
///
/// # Safety
///
/// * If the implementation type is `Sync`, then a pool using this lock will be
///   `Sync`, and therefore this method must provide actual mutual exclusion
///   and prevent against unsynchronized accesses.
///
/// * Even in single-threaded contexts, where real synchronization is not
///   required, this type must prevent recursive locking and re-entering the
///   lock when it is already held. The prevention may be a panic, abort,
///   infinite loop, or etc...
pub unsafe trait Lock {
    /// Acquire the lock.
    ///
    /// If it is already held by this thread, this must result in a panic,
    /// abort, infinite loop, or etc... and locking must not succeed.
    fn lock(&self);

    /// Release the lock.
    fn unlock(&self);
}

/// A single-threaded implementation of [`Lock`].
///
/// This is effectively a `RefCell`: it is `!Sync`, so a pool using it cannot
/// be shared between threads.
#[derive(Debug)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.get(), "pool lock is not re-entrant");
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        assert!(self.locked.get());
        self.locked.set(false);
    }
}

impl Default for SingleThreadedLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SingleThreadedLock {
    /// Construct a new `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

/// A multi-threaded implementation of [`Lock`] backed by
/// `parking_lot::RawMutex`.
#[cfg(feature = "parking_lot")]
pub struct ParkingLotLock {
    raw: parking_lot::RawMutex,
}

#[cfg(feature = "parking_lot")]
unsafe impl Lock for ParkingLotLock {
    #[inline]
    fn lock(&self) {
        parking_lot::lock_api::RawMutex::lock(&self.raw);
    }

    #[inline]
    fn unlock(&self) {
        // Safety: `unlock` is only ever called by `MutexGuard::drop`, which
        // exists only while this lock is held by the current context.
        unsafe { parking_lot::lock_api::RawMutex::unlock(&self.raw) }
    }
}

#[cfg(feature = "parking_lot")]
impl Default for ParkingLotLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "parking_lot")]
impl ParkingLotLock {
    /// Construct a new, unlocked `ParkingLotLock`.
    #[inline]
    pub const fn new() -> Self {
        ParkingLotLock {
            raw: <parking_lot::RawMutex as parking_lot::lock_api::RawMutex>::INIT,
        }
    }
}

#[cfg(feature = "parking_lot")]
impl core::fmt::Debug for ParkingLotLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let locked = parking_lot::lock_api::RawMutex::is_locked(&self.raw);
        f.debug_struct("ParkingLotLock")
            .field("locked", &locked)
            .finish()
    }
}

pub(crate) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: if `T` and `L` can be sent between threads, then the mutex can as
// well. The API, implementation, and borrow checker do not allow for
// unsynchronized accesses in the face of sending these across threads.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: upheld by the `Lock` trait's implementation contract.
//
// Additionally, `T` must be `Send` because locking a mutex from another thread
// and getting a mutex guard allows getting `&mut T`, which can be used to
// `mem::replace()` the `T`, effectively sending it between threads.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(crate) const fn new(value: T, lock: L) -> Self {
        let value = UnsafeCell::new(value);
        Mutex { lock, value }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }

    /// Access the value without locking, which exclusive access makes safe.
    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

pub(crate) struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<T, L> Drop for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.value.get() }
    }
}
