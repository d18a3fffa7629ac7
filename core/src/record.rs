use crate::database::sql_type_wrapper::{SqlValue, SqlValueError};

/// Field access for records handed to a bulk operation.
///
/// Field names are matched case-insensitively, like column names on the server.
pub trait Record {
    /// Every field, in declaration order. `add_all_columns` selects these.
    fn field_names() -> &'static [&'static str];

    fn field(&self, name: &str) -> Option<SqlValue>;

    /// Writes a value read back from the server, used for captured identities.
    fn set_field(&mut self, name: &str, value: SqlValue) -> Result<(), SqlValueError>;

    /// Checks that `set_field` would accept `value` without writing it.
    fn check_field(&self, name: &str, value: &SqlValue) -> Result<(), SqlValueError>;

    fn has_field(name: &str) -> bool {
        Self::field_names().iter().any(|field| field.eq_ignore_ascii_case(name))
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __record_field_name {
    ($field:ident) => {
        stringify!($field)
    };
    ($field:ident, $column:literal) => {
        $column
    };
}

/// Implements [`Record`] for a plain struct.
///
/// Each listed field is exposed under its own name, or under the column name given after `=>`.
///
/// # Example
///
/// ```ignore
/// struct Person {
///     id: i32,
///     name: String,
///     age: Option<i32>,
/// }
///
/// impl_record!(Person { id => "Id", name => "Name", age => "Age" });
/// ```
#[macro_export]
macro_rules! impl_record {
    ($record:ty { $($field:ident $(=> $column:literal)?),+ $(,)? }) => {
        impl $crate::Record for $record {
            fn field_names() -> &'static [&'static str] {
                &[$($crate::__record_field_name!($field $(, $column)?)),+]
            }

            fn field(&self, name: &str) -> Option<$crate::SqlValue> {
                $(
                    if name
                        .eq_ignore_ascii_case($crate::__record_field_name!($field $(, $column)?))
                    {
                        return Some($crate::SqlValue::from(self.$field.clone()));
                    }
                )+
                None
            }

            fn set_field(
                &mut self,
                name: &str,
                value: $crate::SqlValue,
            ) -> Result<(), $crate::SqlValueError> {
                $(
                    if name
                        .eq_ignore_ascii_case($crate::__record_field_name!($field $(, $column)?))
                    {
                        self.$field = $crate::FromSqlValue::from_sql_value(value)?;
                        return Ok(());
                    }
                )+
                Err($crate::SqlValueError::UnknownField(name.to_string()))
            }

            fn check_field(
                &self,
                name: &str,
                value: &$crate::SqlValue,
            ) -> Result<(), $crate::SqlValueError> {
                fn fits<T: $crate::FromSqlValue>(
                    _field: &T,
                    value: &$crate::SqlValue,
                ) -> Result<(), $crate::SqlValueError> {
                    T::from_sql_value(value.clone()).map(|_| ())
                }

                $(
                    if name
                        .eq_ignore_ascii_case($crate::__record_field_name!($field $(, $column)?))
                    {
                        return fits(&self.$field, value);
                    }
                )+
                Err($crate::SqlValueError::UnknownField(name.to_string()))
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Person {
        id: i64,
        name: String,
        age: Option<i32>,
    }

    crate::impl_record!(Person { id => "Id", name => "Name", age });

    #[test]
    fn test_field_names_follow_declaration_order() {
        assert_eq!(Person::field_names(), &["Id", "Name", "age"]);
        assert!(Person::has_field("AGE"));
        assert!(!Person::has_field("Email"));
    }

    #[test]
    fn test_field_access() {
        let person = Person { id: 1, name: "A".to_string(), age: None };

        assert_eq!(person.field("id"), Some(SqlValue::I64(1)));
        assert_eq!(person.field("Name"), Some(SqlValue::String("A".to_string())));
        assert_eq!(person.field("Age"), Some(SqlValue::Null));
        assert_eq!(person.field("Email"), None);
    }

    #[test]
    fn test_set_field_widens_and_rejects_unknown() {
        let mut person = Person { id: 0, name: "A".to_string(), age: None };

        person.set_field("Id", SqlValue::I32(101)).unwrap();
        person.set_field("age", SqlValue::I32(30)).unwrap();
        assert_eq!(person.id, 101);
        assert_eq!(person.age, Some(30));

        assert_eq!(
            person.set_field("Email", SqlValue::Null),
            Err(SqlValueError::UnknownField("Email".to_string()))
        );
        assert!(person.set_field("Name", SqlValue::Null).is_err());
    }

    #[test]
    fn test_check_field_does_not_write() {
        let person = Person { id: 0, name: "A".to_string(), age: None };

        assert!(person.check_field("Id", &SqlValue::I32(101)).is_ok());
        assert!(person.check_field("Id", &SqlValue::Null).is_err());
        assert!(person.check_field("age", &SqlValue::Null).is_ok());
        assert_eq!(
            person.check_field("Email", &SqlValue::I32(1)),
            Err(SqlValueError::UnknownField("Email".to_string()))
        );
        assert_eq!(person.id, 0);
    }
}
