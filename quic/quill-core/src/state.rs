// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Small helpers for enum state machines with checked transitions

use core::fmt;

pub type Result<T> = core::result::Result<(), Error<T>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error<T> {
    /// The event would transition into the state it is already in
    NoOp { current: T },
    /// The event is not valid in the current state
    InvalidTransition { current: T, event: &'static str },
}

impl<T: fmt::Debug> fmt::Display for Error<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp { current } => {
                write!(f, "state is already set to {current:?}")
            }
            Self::InvalidTransition { current, event } => {
                write!(f, "invalid event {event:?} for state {current:?}")
            }
        }
    }
}

#[cfg(feature = "std")]
impl<T: fmt::Debug> std::error::Error for Error<T> {}

/// Generates a boolean state query
#[macro_export]
macro_rules! __state_is__ {
    ($(#[doc = $doc:literal])* $function:ident, $($state:ident)|+) => {
        $(
            #[doc = $doc]
        )*
        #[inline]
        pub fn $function(&self) -> bool {
            matches!(self, $(Self::$state)|+)
        }
    };
}

pub use crate::__state_is__ as is;

/// Generates checked transition methods; each event lists the states it
/// is valid in and the state it transitions to.
#[macro_export]
macro_rules! __state_event__ {
    ($(
        $(#[doc = $doc:literal])*
        $event:ident ( $( $($valid:ident)|+ => $target:ident ),+ $(,)? );
    )*) => {
        $(
            $(
                #[doc = $doc]
            )*
            #[inline]
            pub fn $event(&mut self) -> $crate::state::Result<Self> {
                match self {
                    $(
                        $(Self::$valid)|+ => {
                            *self = Self::$target;
                            Ok(())
                        }
                    )+
                    _ if matches!(self, $(Self::$target)|+) => {
                        Err($crate::state::Error::NoOp {
                            current: self.clone(),
                        })
                    }
                    _ => Err($crate::state::Error::InvalidTransition {
                        current: self.clone(),
                        event: stringify!($event),
                    }),
                }
            }
        )*
    };
}

pub use crate::__state_event__ as event;
