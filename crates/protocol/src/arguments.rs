//! Typed conversion between Rust values and invocation argument lists.
//!
//! Handlers and push callbacks take a tuple of deserializable types (or a
//! raw `Vec<Value>`); callers pass a tuple of serializable types.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::ProtocolError;

/// Decodes an argument list into a typed value.
pub trait FromArguments: Sized {
    /// Number of arguments expected, or `None` when any count is accepted.
    const ARITY: Option<usize>;

    fn from_arguments(arguments: Vec<Value>) -> Result<Self, ProtocolError>;
}

/// Encodes a typed value into an argument list.
pub trait IntoArguments {
    fn into_arguments(self) -> Result<Vec<Value>, ProtocolError>;
}

impl FromArguments for Vec<Value> {
    const ARITY: Option<usize> = None;

    fn from_arguments(arguments: Vec<Value>) -> Result<Self, ProtocolError> {
        Ok(arguments)
    }
}

impl IntoArguments for Vec<Value> {
    fn into_arguments(self) -> Result<Vec<Value>, ProtocolError> {
        Ok(self)
    }
}

impl FromArguments for () {
    const ARITY: Option<usize> = Some(0);

    fn from_arguments(arguments: Vec<Value>) -> Result<Self, ProtocolError> {
        check_count(0, arguments.len())
    }
}

impl IntoArguments for () {
    fn into_arguments(self) -> Result<Vec<Value>, ProtocolError> {
        Ok(Vec::new())
    }
}

fn check_count(expected: usize, actual: usize) -> Result<(), ProtocolError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ProtocolError::ArgumentCount { expected, actual })
    }
}

fn bind<T: DeserializeOwned>(index: usize, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::ArgumentType {
        index,
        reason: e.to_string(),
    })
}

macro_rules! tuple_arguments {
    ($count:expr; $($name:ident $idx:tt),+) => {
        impl<$($name: DeserializeOwned),+> FromArguments for ($($name,)+) {
            const ARITY: Option<usize> = Some($count);

            fn from_arguments(arguments: Vec<Value>) -> Result<Self, ProtocolError> {
                check_count($count, arguments.len())?;
                let mut iter = arguments.into_iter();
                Ok(($(bind::<$name>($idx, iter.next().unwrap_or(Value::Null))?,)+))
            }
        }

        impl<$($name: Serialize),+> IntoArguments for ($($name,)+) {
            fn into_arguments(self) -> Result<Vec<Value>, ProtocolError> {
                Ok(vec![$(serde_json::to_value(&self.$idx)?),+])
            }
        }
    };
}

tuple_arguments!(1; A 0);
tuple_arguments!(2; A 0, B 1);
tuple_arguments!(3; A 0, B 1, C 2);
tuple_arguments!(4; A 0, B 1, C 2, D 3);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn single_string_argument() {
        let (msg,): (String,) = FromArguments::from_arguments(vec![json!("ping")]).unwrap();
        assert_eq!(msg, "ping");
        assert_eq!(<(String,)>::ARITY, Some(1));
    }

    #[test]
    fn wrong_count_is_reported() {
        let err = <(String,)>::from_arguments(vec![json!("a"), json!("b")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invocation provides 2 argument(s) but target expects 1."
        );
        let err = <()>::from_arguments(vec![json!(1)]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::ArgumentCount {
                expected: 0,
                actual: 1
            }
        ));
    }

    #[test]
    fn wrong_type_names_the_index() {
        let err = <(String, u32)>::from_arguments(vec![json!("a"), json!("x")]).unwrap_err();
        assert!(matches!(err, ProtocolError::ArgumentType { index: 1, .. }));
    }

    #[test]
    fn tuples_encode_in_order() {
        let args = ("hello", 3u8, true).into_arguments().unwrap();
        assert_eq!(args, vec![json!("hello"), json!(3), json!(true)]);
    }

    #[test]
    fn raw_values_pass_through() {
        let raw = vec![json!(1), json!("two")];
        assert_eq!(Vec::<Value>::ARITY, None);
        assert_eq!(Vec::<Value>::from_arguments(raw.clone()).unwrap(), raw);
    }
}
