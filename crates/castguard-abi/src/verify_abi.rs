//! Cast verification entry points.

use std::ffi::c_int;

use castguard_core::TypeHash;

abi_fn! {
    /// Checked cast of `src` to `dst` as the type hashed `dst_hash`.
    ///
    /// Rejects are reported; under the fatal policy the process exits.
    fn castguard_verify_cast(src: usize, dst: usize, dst_hash: u64),
    runtime(rt);
    {
        rt.verify_cast(src, dst, TypeHash(dst_hash));
    }
}

abi_fn! {
    /// [`castguard_verify_cast`] for casts that do not move the pointer.
    fn castguard_verify_type(src: usize, dst_hash: u64),
    runtime(rt);
    {
        rt.verify_cast(src, src, TypeHash(dst_hash));
    }
}

abi_fn! {
    /// Decide a cast without reporting. Returns 0 to accept, otherwise the
    /// reject reason code.
    fn castguard_resolve_cast(src: usize, dst: usize, dst_hash: u64) -> c_int,
    runtime(rt) else 0;
    {
        rt.resolve_cast(src, dst, TypeHash(dst_hash)).code()
    }
}
