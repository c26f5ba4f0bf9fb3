//! # Resolver Module
//!
//! Get-or-create lookups keyed by attribute equality, and validated bulk
//! attribute updates.
//!
//! ## Example
//!
//! ```rust,ignore
//! let user = session.get_or_create(&users, fields! { "name" => "alice" }).await?;
//! session.update_object(&user, fields! { "fullname" => "Alice Liddell" })?;
//! ```

use std::sync::Arc;

use crate::{
    Error, Result,
    mapper::MappedType,
    object::Object,
    session::Session,
    value::Fields,
};

impl Session {
    /// Returns the single object matching `predicate`, creating it if none does.
    ///
    /// A created object is added to the session as pending but not flushed.
    /// More than one match fails with [`Error::NonUniqueResult`].
    pub async fn get_or_create(&mut self, mapped: &Arc<MappedType>, predicate: Fields) -> Result<Object> {
        self.check_type(mapped)?;
        let filter = mapped.equality_filter(&predicate)?;
        if self.options().autoflush {
            self.flush().await?;
        }

        match self.count_filter(mapped, &filter).await? {
            0 => {
                log::debug!("no {} matches, creating one", mapped.name());
                let object = mapped.instantiate(predicate)?;
                self.add(&object)?;
                Ok(object)
            }
            1 => self
                .select(mapped, &filter)
                .await?
                .pop()
                .ok_or(Error::Database(sqlx::Error::RowNotFound)),
            count => Err(Error::NonUniqueResult { class: mapped.name().to_string(), count }),
        }
    }

    /// Applies `fields` to an object tracked by this session's binding.
    pub fn update_object(&self, object: &Object, fields: Fields) -> Result<()> {
        self.check_object(object)?;
        update_object(object, fields)
    }

    /// [`get_or_create`](Self::get_or_create) followed by
    /// [`update_object`](Self::update_object).
    pub async fn get_or_create_and_update(
        &mut self,
        mapped: &Arc<MappedType>,
        predicate: Fields,
        fields: Fields,
    ) -> Result<Object> {
        let object = self.get_or_create(mapped, predicate).await?;
        self.update_object(&object, fields)?;
        Ok(object)
    }
}

/// Assigns every field of `fields` to `object`.
///
/// All keys are validated first; if any is unknown or of the wrong kind the
/// object is left untouched.
pub fn update_object(object: &Object, fields: Fields) -> Result<()> {
    for (attribute, value) in fields.iter() {
        object.check(attribute, value)?;
    }
    for (attribute, value) in fields {
        object.apply(&attribute, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        object::ObjectState,
        schema::{ColumnSchema, ColumnType, TableSchema},
        value::Value,
    };

    fn user_type() -> Arc<MappedType> {
        let column = |name: &str, column_type, primary_key| ColumnSchema {
            name: name.to_string(),
            column_type,
            sql_type: String::new(),
            primary_key,
            nullable: !primary_key,
            unique: false,
            index: false,
        };
        let table = TableSchema {
            name: "users".to_string(),
            columns: vec![
                column("id", ColumnType::Integer, true),
                column("name", ColumnType::Text, false),
                column("age", ColumnType::Integer, false),
            ],
            foreign_keys: Vec::new(),
        };
        let attributes: BTreeMap<String, String> =
            ["id", "name", "age"].into_iter().map(|c| (c.to_string(), c.to_string())).collect();
        Arc::new(MappedType {
            name: "User".to_string(),
            table: Arc::new(table),
            columns: attributes.clone(),
            attributes,
            relationships: BTreeMap::new(),
            generation: 1,
        })
    }

    #[test]
    fn updates_are_all_or_nothing() {
        let user = user_type().instantiate(Fields::new().with("name", "alice")).unwrap();

        let err = update_object(&user, Fields::new().with("age", 30).with("nickname", "al")).unwrap_err();
        assert!(matches!(err, Error::UnknownAttribute { ref attribute, .. } if attribute == "nickname"));
        assert_eq!(user.get("age").unwrap(), Value::Null);
        assert!(!user.lock().modified.contains("age"));

        update_object(&user, Fields::new().with("age", 30)).unwrap();
        assert_eq!(user.get("age").unwrap(), Value::Integer(30));
        assert_eq!(user.state(), ObjectState::Transient);
    }

    #[test]
    fn instantiate_rejects_unknown_attributes() {
        let err = user_type().instantiate(Fields::new().with("email", "a@b")).unwrap_err();
        assert!(matches!(err, Error::UnknownAttribute { ref class, .. } if class == "User"));
    }
}
