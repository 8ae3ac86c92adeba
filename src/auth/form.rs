//! Typed form fields for the form-input auth method.

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, Result};

/// Value carried by a form field. The variant is the field's type.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FormValue {
    PlainString(String),
    /// Rendered masked by the host and never logged.
    ObscuredString(String),
    Integer(i64),
    DirectoryPath(String),
}

impl FormValue {
    pub fn kind(&self) -> &'static str {
        match self {
            FormValue::PlainString(_) => "plain_string",
            FormValue::ObscuredString(_) => "obscured_string",
            FormValue::Integer(_) => "integer",
            FormValue::DirectoryPath(_) => "directory_path",
        }
    }

    fn same_kind(&self, other: &FormValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl std::fmt::Debug for FormValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormValue::PlainString(v) => f.debug_tuple("PlainString").field(v).finish(),
            FormValue::ObscuredString(_) => f.write_str("ObscuredString([REDACTED])"),
            FormValue::Integer(v) => f.debug_tuple("Integer").field(v).finish(),
            FormValue::DirectoryPath(v) => f.debug_tuple("DirectoryPath").field(v).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormItem {
    pub name: String,
    pub value: FormValue,
}

impl FormItem {
    pub fn new(name: impl Into<String>, value: FormValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Ordered list of named fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormData {
    pub items: Vec<FormItem>,
}

impl FormData {
    pub fn new(items: Vec<FormItem>) -> Self {
        Self { items }
    }

    /// Checks that `self` has the same field count, names, order and kinds as
    /// the advertised form.
    pub fn validate_against(&self, advertised: &FormData) -> Result<()> {
        if self.items.len() != advertised.items.len() {
            return Err(PluginError::validation(format!(
                "expected {} form fields, got {}",
                advertised.items.len(),
                self.items.len()
            )));
        }
        for (submitted, expected) in self.items.iter().zip(&advertised.items) {
            if submitted.name != expected.name {
                return Err(PluginError::validation(format!(
                    "expected field '{}', got '{}'",
                    expected.name, submitted.name
                )));
            }
            if !submitted.value.same_kind(&expected.value) {
                return Err(PluginError::validation(format!(
                    "field '{}' must be {}, got {}",
                    expected.name,
                    expected.value.kind(),
                    submitted.value.kind()
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FormValue> {
        self.items
            .iter()
            .find(|item| item.name == name)
            .map(|item| &item.value)
    }

    /// Returns the string content of a plain, obscured or path field.
    pub fn string(&self, name: &str) -> Result<&str> {
        match self.get(name) {
            Some(
                FormValue::PlainString(v)
                | FormValue::ObscuredString(v)
                | FormValue::DirectoryPath(v),
            ) => Ok(v.as_str()),
            Some(other) => Err(PluginError::validation(format!(
                "field '{name}' is {}, not a string",
                other.kind()
            ))),
            None => Err(PluginError::validation(format!("missing field '{name}'"))),
        }
    }

    /// Like [`FormData::string`] but rejects blank values.
    pub fn required_string(&self, name: &str) -> Result<&str> {
        let value = self.string(name)?;
        if value.trim().is_empty() {
            return Err(PluginError::validation(format!("field '{name}' is empty")));
        }
        Ok(value)
    }

    pub fn integer(&self, name: &str) -> Result<i64> {
        match self.get(name) {
            Some(FormValue::Integer(v)) => Ok(*v),
            Some(other) => Err(PluginError::validation(format!(
                "field '{name}' is {}, not an integer",
                other.kind()
            ))),
            None => Err(PluginError::validation(format!("missing field '{name}'"))),
        }
    }
}
