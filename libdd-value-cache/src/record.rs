// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ValueCacheError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Seconds since the epoch plus nanoseconds. Orders by seconds, then
/// nanoseconds.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub sec: i64,
    pub ns: u32,
}

impl Timestamp {
    pub const fn new(sec: i64, ns: u32) -> Self {
        Timestamp { sec, ns }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.ns)
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Float = 0,
    Str = 1,
    Log = 2,
    Uint = 3,
    Text = 4,
}

impl TryFrom<u8> for ValueType {
    type Error = ValueCacheError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ValueType::Float,
            1 => ValueType::Str,
            2 => ValueType::Log,
            3 => ValueType::Uint,
            4 => ValueType::Text,
            other => return Err(ValueCacheError::UnknownValueType(other)),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogValue {
    pub timestamp: i32,
    pub severity: i32,
    pub logeventid: i32,
    pub source: Option<String>,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HistoryValue {
    Float(f64),
    Str(String),
    Log(LogValue),
    Uint(u64),
    Text(String),
}

impl HistoryValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            HistoryValue::Float(_) => ValueType::Float,
            HistoryValue::Str(_) => ValueType::Str,
            HistoryValue::Log(_) => ValueType::Log,
            HistoryValue::Uint(_) => ValueType::Uint,
            HistoryValue::Text(_) => ValueType::Text,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: Timestamp,
    pub value: HistoryValue,
}

impl HistoryRecord {
    pub fn new(timestamp: Timestamp, value: HistoryValue) -> Self {
        HistoryRecord { timestamp, value }
    }
}
