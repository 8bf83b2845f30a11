//! Error codes returned by the runtime's operations.
//!
//! Every operation has its own error type listing exactly the codes it can
//! produce. All of them share their discriminants with [`ResultCode`], the
//! flat code an embedding can reduce any result to.

/// All result codes of the runtime, i.e. the union of the codes every
/// per-operation error type can produce, plus `Success`.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// The operation completed.
    Success = 0,
    /// The operation could not be carried out, e.g. a mutex acquisition
    /// timed out.
    Failure = -1,
    /// A parameter had a value the operation cannot accept.
    InvalidParameter = -2,
    /// An object identifier referred to no live object.
    InvalidId = -3,
    /// The object exists but is in a state the operation does not allow.
    InvalidState = -4,
    /// A resource (memory, slots) was exhausted.
    InsufficientResources = -5,
}

impl ResultCode {
    pub fn is_ok(self) -> bool {
        self == Self::Success
    }

    pub fn is_err(self) -> bool {
        !self.is_ok()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::InvalidParameter => "invalid parameter",
            Self::InvalidId => "invalid id",
            Self::InvalidState => "invalid state",
            Self::InsufficientResources => "insufficient resources",
        }
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        pub enum $name:ident {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)?
        }
    ) => {
        $( #[$meta] )*
        #[repr(i8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $(
                $( #[$vmeta] )*
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl From<$name> for ResultCode {
            fn from(x: $name) -> Self {
                // Safety: `x`'s discriminant is always a valid `ResultCode`
                // discriminant by construction.
                unsafe { core::mem::transmute(x) }
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => ResultCode::Success,
                    Err(e) => e.into(),
                }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn maps_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::from($name::$vname),
                        ResultCode::$vname,
                    );
                    assert_eq!(
                        ResultCode::from($name::$vname) as i8,
                        $name::$vname as i8,
                    );
                )*
            }

            #[test]
            fn result_maps_to_result_code() {
                assert_eq!(
                    ResultCode::from(Ok::<(), $name>(())),
                    ResultCode::Success,
                );
                $(
                    assert_eq!(
                        ResultCode::from(Err::<(), $name>($name::$vname)),
                        ResultCode::$vname,
                    );
                )*
            }
        }
    };
}

define_error! {
    mod create_thread_error {}
    /// Error type for [`Kernel::thread_create`](crate::Kernel::thread_create).
    pub enum CreateThreadError {
        /// The requested stack size was zero.
        InvalidParameter,
        /// The system pool could not supply the stack.
        InsufficientResources,
    }
}

define_error! {
    mod activate_thread_error {}
    /// Error type for [`Kernel::thread_activate`](crate::Kernel::thread_activate).
    pub enum ActivateThreadError {
        InvalidId,
        /// The thread is not dead.
        InvalidState,
    }
}

define_error! {
    mod terminate_thread_error {}
    /// Error type for [`Kernel::thread_terminate`](crate::Kernel::thread_terminate).
    pub enum TerminateThreadError {
        InvalidId,
        /// The thread is already dead.
        InvalidState,
    }
}

define_error! {
    mod delete_thread_error {}
    /// Error type for [`Kernel::thread_delete`](crate::Kernel::thread_delete).
    pub enum DeleteThreadError {
        InvalidId,
        /// Only dead threads can be deleted.
        InvalidState,
    }
}

define_error! {
    mod sleep_error {}
    /// Error type for [`Kernel::thread_sleep`](crate::Kernel::thread_sleep).
    pub enum SleepError {
        /// An infinite sleep can never be woken.
        InvalidParameter,
    }
}

define_error! {
    mod query_thread_error {}
    /// Error type for [`Kernel::thread_state`](crate::Kernel::thread_state).
    pub enum QueryThreadError {
        InvalidId,
    }
}

define_error! {
    mod delete_mutex_error {}
    /// Error type for [`Kernel::mutex_delete`](crate::Kernel::mutex_delete).
    pub enum DeleteMutexError {
        InvalidId,
        /// The mutex is currently held.
        InvalidState,
    }
}

define_error! {
    mod acquire_mutex_error {}
    /// Error type for [`Kernel::mutex_acquire`](crate::Kernel::mutex_acquire).
    pub enum AcquireMutexError {
        InvalidId,
        /// The mutex could not be acquired within the timeout.
        Failure,
    }
}

define_error! {
    mod release_mutex_error {}
    /// Error type for [`Kernel::mutex_release`](crate::Kernel::mutex_release).
    pub enum ReleaseMutexError {
        InvalidId,
        /// The calling thread does not hold the mutex.
        InvalidState,
    }
}

define_error! {
    mod query_mutex_error {}
    /// Error type for [`Kernel::mutex_owner`](crate::Kernel::mutex_owner).
    pub enum QueryMutexError {
        InvalidId,
    }
}

define_error! {
    mod create_pool_error {}
    /// Error type for [`Kernel::pool_create`](crate::Kernel::pool_create).
    pub enum CreatePoolError {
        /// The base address or the size was zero.
        InvalidParameter,
    }
}

define_error! {
    mod allocate_pool_error {}
    /// Error type for [`Kernel::pool_allocate`](crate::Kernel::pool_allocate).
    pub enum AllocatePoolError {
        /// The pool id named no live pool, or the size was zero.
        InvalidParameter,
        /// No free span is large enough.
        InsufficientResources,
    }
}

define_error! {
    mod deallocate_pool_error {}
    /// Error type for [`Kernel::pool_deallocate`](crate::Kernel::pool_deallocate).
    pub enum DeallocatePoolError {
        /// The pool id named no live pool, or the address is not the base of
        /// an allocated span.
        InvalidParameter,
    }
}

define_error! {
    mod delete_pool_error {}
    /// Error type for [`Kernel::pool_delete`](crate::Kernel::pool_delete).
    pub enum DeletePoolError {
        InvalidParameter,
        /// Allocations are still outstanding.
        InvalidState,
    }
}

define_error! {
    mod query_pool_error {}
    /// Error type for [`Kernel::pool_query`](crate::Kernel::pool_query).
    pub enum QueryPoolError {
        InvalidParameter,
    }
}

define_error! {
    mod io_error {}
    /// Error type for the file operations.
    pub enum IoError {
        /// A parameter was unusable, e.g. a path with an interior NUL byte.
        InvalidParameter,
        /// The machine layer reported the operation failed.
        Failure,
    }
}

define_error! {
    mod start_error {}
    /// Error type for [`start`](crate::start).
    pub enum StartError {
        /// The configuration was unusable, e.g. a zero tick period.
        InvalidParameter,
    }
}
