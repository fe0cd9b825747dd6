//! Value coercion between typed Rust values and the single database parameter.
//!
//! Outbound, [`ToParam`] renders a value as one `rusqlite` parameter:
//! primitives pass through, dates and uuids become canonical strings, and
//! structured values wrapped in [`Json`] become compact JSON text. Inbound,
//! [`FromRaw`] reads a raw column value back. Absent input (`None`, `()`,
//! JSON `null`) binds SQL NULL, and NULL or empty raw values read back as the
//! target's default instead of failing.
//!
//! The strategy is picked by the declared type at the call site: `String`
//! and `Vec<u8>` targets skip JSON entirely, `Json<T>` goes through serde.

use crate::core::{Result, SprocketError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::type_name;
use std::borrow::Cow;
use std::ops::{Deref, DerefMut};
use uuid::Uuid;

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const DATETIME_FORMAT_SPACED: &str = "%Y-%m-%d %H:%M:%S%.f";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Marks a structured value that travels as JSON text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Json<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> From<T> for Json<T> {
    fn from(value: T) -> Self {
        Json(value)
    }
}

/// Renders a value as the single command parameter.
pub trait ToParam {
    fn to_param(&self) -> Result<Value>;
}

/// Reads a value back from a raw database value.
///
/// `from_raw` is only called with non-empty input; NULL and empty values
/// are mapped to `Default::default()` by [`deserialize`].
pub trait FromRaw: Default + Sized {
    fn from_raw(raw: Value) -> Result<Self>;
}

/// Serializes `value` into a parameter.
pub fn serialize<T: ToParam + ?Sized>(value: &T) -> Result<Value> {
    value.to_param()
}

/// Deserializes a raw value, yielding `T::default()` for NULL or empty input.
pub fn deserialize<T: FromRaw>(raw: Value) -> Result<T> {
    if is_absent(&raw) {
        return Ok(T::default());
    }
    T::from_raw(raw)
}

/// True for NULL, empty text and empty blobs.
pub fn is_absent(raw: &Value) -> bool {
    match raw {
        Value::Null => true,
        Value::Text(s) => s.is_empty(),
        Value::Blob(b) => b.is_empty(),
        _ => false,
    }
}

fn raw_display(raw: &Value) -> String {
    match raw {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

fn mismatch<T>(raw: &Value, message: impl Into<String>) -> SprocketError {
    SprocketError::Deserialization {
        raw: raw_display(raw),
        type_name: type_name::<T>(),
        message: message.into(),
    }
}

fn unserializable<T: ?Sized>(message: impl Into<String>) -> SprocketError {
    SprocketError::Serialization {
        type_name: type_name::<T>(),
        message: message.into(),
    }
}

/// Textual view of a raw value, if it has one.
fn raw_text(raw: &Value) -> Option<Cow<'_, str>> {
    match raw {
        Value::Text(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Integer(i) => Some(Cow::Owned(i.to_string())),
        Value::Real(f) => Some(Cow::Owned(f.to_string())),
        Value::Blob(b) => std::str::from_utf8(b).ok().map(Cow::Borrowed),
        Value::Null => None,
    }
}

/// Accepts both `value` and `"value"`: scalars may arrive straight from a
/// driver column or as a JSON string field.
fn unquote(text: &str) -> Cow<'_, str> {
    let trimmed = text.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        if let Ok(inner) = serde_json::from_str::<String>(trimmed) {
            return Cow::Owned(inner);
        }
    }
    Cow::Borrowed(trimmed)
}

fn tolerant_text<T>(raw: &Value) -> Result<Cow<'_, str>> {
    match raw_text(raw) {
        Some(Cow::Borrowed(s)) => Ok(unquote(s)),
        Some(Cow::Owned(s)) => Ok(Cow::Owned(unquote(&s).into_owned())),
        None => Err(mismatch::<T>(raw, "value has no textual form")),
    }
}

impl<T: ToParam + ?Sized> ToParam for &T {
    fn to_param(&self) -> Result<Value> {
        (**self).to_param()
    }
}

impl<T: ToParam> ToParam for Option<T> {
    fn to_param(&self) -> Result<Value> {
        match self {
            Some(value) => value.to_param(),
            None => Ok(Value::Null),
        }
    }
}

impl<T: FromRaw> FromRaw for Option<T> {
    fn from_raw(raw: Value) -> Result<Self> {
        T::from_raw(raw).map(Some)
    }
}

/// No data
impl ToParam for () {
    fn to_param(&self) -> Result<Value> {
        Ok(Value::Null)
    }
}

impl ToParam for bool {
    fn to_param(&self) -> Result<Value> {
        Ok(Value::Integer(i64::from(*self)))
    }
}

impl FromRaw for bool {
    fn from_raw(raw: Value) -> Result<Self> {
        match &raw {
            Value::Integer(i) => Ok(*i != 0),
            _ => {
                let text = tolerant_text::<bool>(&raw)?;
                match text.to_ascii_lowercase().as_str() {
                    "true" | "1" => Ok(true),
                    "false" | "0" => Ok(false),
                    _ => Err(mismatch::<bool>(&raw, "expected true/false or 1/0")),
                }
            }
        }
    }
}

macro_rules! integer_coercion {
    ($($ty:ty),*) => {$(
        impl ToParam for $ty {
            fn to_param(&self) -> Result<Value> {
                i64::try_from(*self)
                    .map(Value::Integer)
                    .map_err(|e| unserializable::<$ty>(e.to_string()))
            }
        }

        impl FromRaw for $ty {
            fn from_raw(raw: Value) -> Result<Self> {
                match &raw {
                    Value::Integer(i) => {
                        <$ty>::try_from(*i).map_err(|e| mismatch::<$ty>(&raw, e.to_string()))
                    }
                    _ => {
                        let text = tolerant_text::<$ty>(&raw)?;
                        text.parse::<$ty>().map_err(|e| mismatch::<$ty>(&raw, e.to_string()))
                    }
                }
            }
        }
    )*};
}

integer_coercion!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

macro_rules! float_coercion {
    ($($ty:ty),*) => {$(
        impl ToParam for $ty {
            fn to_param(&self) -> Result<Value> {
                Ok(Value::Real(f64::from(*self)))
            }
        }

        impl FromRaw for $ty {
            fn from_raw(raw: Value) -> Result<Self> {
                match &raw {
                    Value::Real(f) => Ok(*f as $ty),
                    Value::Integer(i) => Ok(*i as $ty),
                    _ => {
                        let text = tolerant_text::<$ty>(&raw)?;
                        text.parse::<$ty>().map_err(|e| mismatch::<$ty>(&raw, e.to_string()))
                    }
                }
            }
        }
    )*};
}

float_coercion!(f32, f64);

impl ToParam for str {
    fn to_param(&self) -> Result<Value> {
        Ok(Value::Text(self.to_string()))
    }
}

impl ToParam for String {
    fn to_param(&self) -> Result<Value> {
        self.as_str().to_param()
    }
}

/// Plain text passes through untouched, no JSON decoding.
impl FromRaw for String {
    fn from_raw(raw: Value) -> Result<Self> {
        match raw {
            Value::Text(s) => Ok(s),
            Value::Blob(b) => {
                String::from_utf8(b).map_err(|e| mismatch::<String>(&Value::Null, e.to_string()))
            }
            other => raw_text(&other)
                .map(Cow::into_owned)
                .ok_or_else(|| mismatch::<String>(&other, "value has no textual form")),
        }
    }
}

impl ToParam for [u8] {
    fn to_param(&self) -> Result<Value> {
        Ok(Value::Blob(self.to_vec()))
    }
}

impl ToParam for Vec<u8> {
    fn to_param(&self) -> Result<Value> {
        self.as_slice().to_param()
    }
}

/// Binary passes through untouched; text is taken as its UTF-8 bytes.
impl FromRaw for Vec<u8> {
    fn from_raw(raw: Value) -> Result<Self> {
        match raw {
            Value::Blob(b) => Ok(b),
            Value::Text(s) => Ok(s.into_bytes()),
            other => Err(mismatch::<Vec<u8>>(&other, "expected text or blob")),
        }
    }
}

impl ToParam for Uuid {
    fn to_param(&self) -> Result<Value> {
        Ok(Value::Text(self.hyphenated().to_string()))
    }
}

impl FromRaw for Uuid {
    fn from_raw(raw: Value) -> Result<Self> {
        if let Value::Blob(bytes) = &raw {
            if bytes.len() == 16 {
                return Uuid::from_slice(bytes).map_err(|e| mismatch::<Uuid>(&raw, e.to_string()));
            }
        }
        let text = tolerant_text::<Uuid>(&raw)?;
        Uuid::parse_str(&text).map_err(|e| mismatch::<Uuid>(&raw, e.to_string()))
    }
}

impl ToParam for DateTime<Utc> {
    fn to_param(&self) -> Result<Value> {
        Ok(Value::Text(self.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
    }
}

impl FromRaw for DateTime<Utc> {
    fn from_raw(raw: Value) -> Result<Self> {
        if let Value::Integer(secs) = raw {
            return DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| mismatch::<Self>(&raw, "timestamp out of range"));
        }
        let text = tolerant_text::<Self>(&raw)?;
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&text) {
            return Ok(parsed.with_timezone(&Utc));
        }
        parse_naive_datetime(&text)
            .map(|naive| naive.and_utc())
            .ok_or_else(|| mismatch::<Self>(&raw, "expected an RFC 3339 date/time"))
    }
}

fn parse_naive_datetime(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, DATETIME_FORMAT_SPACED))
        .ok()
}

impl ToParam for NaiveDateTime {
    fn to_param(&self) -> Result<Value> {
        Ok(Value::Text(self.format(DATETIME_FORMAT).to_string()))
    }
}

impl FromRaw for NaiveDateTime {
    fn from_raw(raw: Value) -> Result<Self> {
        let text = tolerant_text::<Self>(&raw)?;
        parse_naive_datetime(&text)
            .or_else(|| {
                DateTime::parse_from_rfc3339(&text)
                    .ok()
                    .map(|dt| dt.naive_utc())
            })
            .ok_or_else(|| mismatch::<Self>(&raw, "expected YYYY-MM-DDTHH:MM:SS"))
    }
}

impl ToParam for NaiveDate {
    fn to_param(&self) -> Result<Value> {
        Ok(Value::Text(self.format(DATE_FORMAT).to_string()))
    }
}

impl FromRaw for NaiveDate {
    fn from_raw(raw: Value) -> Result<Self> {
        let text = tolerant_text::<Self>(&raw)?;
        NaiveDate::parse_from_str(&text, DATE_FORMAT)
            .map_err(|e| mismatch::<Self>(&raw, e.to_string()))
    }
}

impl<T: Serialize> ToParam for Json<T> {
    fn to_param(&self) -> Result<Value> {
        let text = serde_json::to_string(&self.0).map_err(|e| unserializable::<T>(e.to_string()))?;
        if text == "null" {
            Ok(Value::Null)
        } else {
            Ok(Value::Text(text))
        }
    }
}

impl<T: DeserializeOwned + Default> FromRaw for Json<T> {
    fn from_raw(raw: Value) -> Result<Self> {
        let parsed = match &raw {
            Value::Integer(i) => serde_json::from_value(serde_json::Value::from(*i)),
            Value::Real(f) => serde_json::from_value(serde_json::Value::from(*f)),
            _ => {
                let text = raw_text(&raw)
                    .ok_or_else(|| mismatch::<T>(&raw, "value has no textual form"))?;
                let trimmed = text.trim();
                // JSON null carries no value, same as SQL NULL
                if trimmed == "null" {
                    return Ok(Json(T::default()));
                }
                serde_json::from_str(trimmed).or_else(|first| {
                    // "\"17\"" for an Option<i32> field: parse what the quotes hold
                    let inner = unquote(trimmed);
                    if inner != trimmed {
                        if let Ok(value) = serde_json::from_str(&inner) {
                            return Ok(value);
                        }
                    }
                    // bare enum names and unquoted strings
                    serde_json::from_value(serde_json::Value::String(inner.into_owned()))
                        .map_err(|_| first)
                })
            }
        };
        parsed.map(Json).map_err(|e| mismatch::<T>(&raw, e.to_string()))
    }
}

impl ToParam for serde_json::Value {
    fn to_param(&self) -> Result<Value> {
        Json(self).to_param()
    }
}

impl FromRaw for serde_json::Value {
    fn from_raw(raw: Value) -> Result<Self> {
        Json::<serde_json::Value>::from_raw(raw).map(Json::into_inner)
    }
}
