// Copyright (c) Walrus Foundation
// SPDX-License-Identifier: Apache-2.0

//! Test utilities shared between the hasteward crates.

use chrono::{DateTime, TimeZone, Utc};

/// A result type useful in tests, that wraps any error implementation.
pub type Result<T = ()> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Macro for creating parametrized *synchronous* tests.
///
/// Accepts the name of an existing function followed by a list of case names
/// and their arguments, and expands to a module with one `#[test]` function
/// per case. Each case calls the named function with its arguments.
///
/// ```
/// # use hasteward_test_utils::param_test;
/// param_test! {
///     test_sum: [
///         positive: (10, 7, 17),
///         negative: (-5, -3, -8),
///     ]
/// }
/// fn test_sum(lhs: i32, rhs: i32, sum: i32) {
///     assert_eq!(lhs + rhs, sum);
/// }
/// ```
#[macro_export]
macro_rules! param_test {
    ($func_name:ident -> $return_ty:ty: [
        $( $(#[$case_meta:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $(
                #[test]
                $(#[$case_meta])*
                fn $case_name() -> $return_ty {
                    $func_name($($args),*)
                }
            )*
        }
    };
    ($func_name:ident: [
        $( $(#[$case_meta:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        $crate::param_test!(
            $func_name -> ():
            [ $( $(#[$case_meta])* $case_name: ( $($args),* ) ),+ ]
        );
    };
}

/// Macro for creating parametrized *asynchronous* tests.
///
/// Behaves like [`param_test`] but must be used with an `async` function;
/// each case is expanded with the `#[tokio::test]` attribute.
#[macro_export]
macro_rules! async_param_test {
    ($func_name:ident -> $return_ty:ty: [
        $( $(#[$case_meta:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $(
                #[tokio::test]
                $(#[$case_meta])*
                async fn $case_name() -> $return_ty {
                    $func_name($($args),*).await
                }
            )*
        }
    };
    ($func_name:ident: [
        $( $(#[$case_meta:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        $crate::async_param_test!(
            $func_name -> ():
            [ $( $(#[$case_meta])* $case_name: ( $($args),* ) ),+ ]
        );
    };
}

/// Asserts that two sequences whose items implement [`Ord`] are equal,
/// irrespective of ordering.
#[macro_export]
macro_rules! assert_unordered_eq {
    ($lhs:expr, $rhs:expr) => {
        let mut lhs: Vec<_> = $lhs.into_iter().collect();
        let mut rhs: Vec<_> = $rhs.into_iter().collect();

        lhs.sort();
        rhs.sort();

        assert_eq!(lhs, rhs);
    };
}

/// Parses an RFC 3339 timestamp, panicking on malformed input.
///
/// Convenience for building snapshot and evidence fixtures.
pub fn utc(timestamp: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(timestamp)
        .unwrap_or_else(|error| panic!("invalid test timestamp {timestamp:?}: {error}"))
        .with_timezone(&Utc)
}

/// Builds a UTC datetime from date and time components.
pub fn utc_ymd_hms(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
        .single()
        .expect("valid test datetime components")
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    param_test! {
        parses_integers -> std::result::Result<(), Box<dyn Error>>: [
            positive: ("21", 21),
            negative: ("-17", -17),
        ]
    }
    fn parses_integers(to_parse: &str, expected: i32) -> std::result::Result<(), Box<dyn Error>> {
        assert_eq!(expected, to_parse.parse::<i32>()?);
        Ok(())
    }

    async_param_test! {
        async_sums: [
            small: (2, 3, 5),
            large: (700, 42, 742),
        ]
    }
    async fn async_sums(lhs: usize, rhs: usize, total: usize) {
        assert_eq!(lhs + rhs, total);
    }

    #[test]
    fn utc_parses_rfc3339() {
        let parsed = utc("2024-07-01T12:00:00Z");
        assert_eq!(parsed, utc_ymd_hms(2024, 7, 1, 12, 0, 0));
    }
}
