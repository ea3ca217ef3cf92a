use core::ptr::NonNull;

/// Get the length of a slice pointer without dereferencing it.
///
/// # Safety
///
/// On compilers predating `NonNull<[T]>::len`, `ptr` must be dereferencable.
/// This is a limitation of the polyfill.
#[rustversion::since(1.63)]
#[inline]
pub unsafe fn nonnull_slice_len<T>(ptr: NonNull<[T]>) -> usize {
    ptr.len()
}

/// Polyfill for <https://github.com/rust-lang/rust/issues/71146>
///
/// # Safety
///
/// `ptr` must be dereferencable. This is a limitation of the polyfill.
#[rustversion::before(1.63)]
#[inline]
pub unsafe fn nonnull_slice_len<T>(ptr: NonNull<[T]>) -> usize {
    use core::{cell::UnsafeCell, mem::MaybeUninit};
    // Safety: We are just reading the slice length embedded in the fat
    //         pointer. The region is converted to
    //         `*const [MaybeUninit<UnsafeCell<T>>]` because it might be
    //         uninitialized and there might be outstanding raw pointers into
    //         it.
    (*(ptr.as_ptr() as *const [MaybeUninit<UnsafeCell<T>>])).len()
}

// Polyfill for <https://github.com/rust-lang/rust/issues/74265>
#[inline]
pub fn nonnull_slice_start<T>(ptr: NonNull<[T]>) -> NonNull<T> {
    unsafe { NonNull::new_unchecked(ptr.as_ptr() as *mut T) }
}
