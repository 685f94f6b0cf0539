//! Entry point generation for the exported `castguard_*` symbols.

/// Generate an exported `extern "C"` entry point.
///
/// The `runtime(rt)` forms bind the process runtime to `rt` before the body
/// runs; without a runtime the function returns the fallback (or nothing).
///
/// ```ignore
/// abi_fn! {
///     /// Doc comment.
///     fn castguard_thing(arg: u64) -> c_int, runtime(rt) else -1; {
///         // body runs inside an `unsafe` block with `rt: &'static Runtime`
///     }
/// }
/// ```
///
/// Every form expands to `#[unsafe(no_mangle)] pub unsafe extern "C" fn`.
macro_rules! abi_fn {
    (
        $(#[$meta:meta])*
        fn $name:ident( $($arg:ident : $argty:ty),* $(,)? ) -> $ret:ty,
        runtime($rt:ident) else $fallback:expr;
        $body:block
    ) => {
        $(#[$meta])*
        #[allow(unused_unsafe)]
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $name( $($arg : $argty),* ) -> $ret {
            let Some($rt) = $crate::runtime_state::runtime() else {
                return $fallback;
            };
            unsafe { $body }
        }
    };

    (
        $(#[$meta:meta])*
        fn $name:ident( $($arg:ident : $argty:ty),* $(,)? ),
        runtime($rt:ident);
        $body:block
    ) => {
        $(#[$meta])*
        #[allow(unused_unsafe)]
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $name( $($arg : $argty),* ) {
            let Some($rt) = $crate::runtime_state::runtime() else {
                return;
            };
            unsafe { $body }
        }
    };

    (
        $(#[$meta:meta])*
        fn $name:ident( $($arg:ident : $argty:ty),* $(,)? ) -> $ret:ty
        $body:block
    ) => {
        $(#[$meta])*
        #[allow(unused_unsafe)]
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $name( $($arg : $argty),* ) -> $ret {
            unsafe { $body }
        }
    };

    (
        $(#[$meta:meta])*
        fn $name:ident( $($arg:ident : $argty:ty),* $(,)? )
        $body:block
    ) => {
        $(#[$meta])*
        #[allow(unused_unsafe)]
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $name( $($arg : $argty),* ) {
            unsafe { $body }
        }
    };
}

pub(crate) use abi_fn;
