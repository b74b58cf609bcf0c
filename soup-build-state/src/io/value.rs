//! Reader and writer for parameter value tables (`GenerateParameters`).

use std::io::Read;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{
    ensure_eof, open_versioned, persist_atomic, read_count, read_string, write_header, write_string,
    write_u32,
};
use crate::error::StateError;
use crate::value::{Value, ValueTable};

const MAGIC: &[u8; 4] = b"SVAL";
const VERSION: u32 = 1;

const TAG_TABLE: u8 = 0;
const TAG_LIST: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_BOOLEAN: u8 = 5;

/// Loads a value table. `Ok(None)` means the file does not exist.
pub fn try_load(path: &Path) -> Result<Option<ValueTable>, StateError> {
    let mut reader = match open_versioned(path, MAGIC, VERSION)? {
        Some(reader) => reader,
        None => return Ok(None),
    };

    let value = read_value(&mut reader)?;
    ensure_eof(&mut reader)?;
    match value {
        Value::Table(table) => Ok(Some(table)),
        _ => Err(StateError::corrupt("root value is not a table")),
    }
}

/// Writes the table atomically.
pub fn save(path: &Path, table: &ValueTable) -> Result<(), StateError> {
    persist_atomic(path, &to_bytes(table))
}

/// The exact byte image `save` would write. Round-trip through
/// `to_bytes`/`try_load` is identity, which also makes this a stable
/// fingerprint of a table's contents.
pub fn to_bytes(table: &ValueTable) -> Vec<u8> {
    let mut bytes = Vec::new();
    write_header(&mut bytes, MAGIC, VERSION);
    write_value(&mut bytes, &Value::Table(table.clone()));
    bytes
}

fn read_value(reader: &mut impl Read) -> Result<Value, StateError> {
    let tag = reader.read_u8().map_err(|_| StateError::corrupt("truncated value"))?;
    match tag {
        TAG_TABLE => {
            let count = read_count(reader)?;
            let mut table = ValueTable::new();
            for _ in 0..count {
                let key = read_string(reader)?;
                if table.contains(&key) {
                    return Err(StateError::corrupt(format!("duplicate table key {:?}", key)));
                }
                let value = read_value(reader)?;
                table.set(key, value);
            }
            Ok(Value::Table(table))
        }
        TAG_LIST => {
            let count = read_count(reader)?;
            let mut list = Vec::with_capacity(count as usize);
            for _ in 0..count {
                list.push(read_value(reader)?);
            }
            Ok(Value::List(list))
        }
        TAG_STRING => Ok(Value::String(read_string(reader)?)),
        TAG_INTEGER => Ok(Value::Integer(
            reader.read_i64::<LittleEndian>().map_err(|_| StateError::corrupt("truncated value"))?,
        )),
        TAG_FLOAT => Ok(Value::Float(f64::from_bits(
            reader.read_u64::<LittleEndian>().map_err(|_| StateError::corrupt("truncated value"))?,
        ))),
        TAG_BOOLEAN => {
            match reader.read_u8().map_err(|_| StateError::corrupt("truncated value"))? {
                0 => Ok(Value::Boolean(false)),
                1 => Ok(Value::Boolean(true)),
                other => Err(StateError::corrupt(format!("invalid boolean byte {}", other))),
            }
        }
        other => Err(StateError::corrupt(format!("unknown value tag {}", other))),
    }
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Table(table) => {
            out.push(TAG_TABLE);
            write_u32(out, table.len() as u32);
            for (key, value) in table.iter() {
                write_string(out, key);
                write_value(out, value);
            }
        }
        Value::List(list) => {
            out.push(TAG_LIST);
            write_u32(out, list.len() as u32);
            for value in list {
                write_value(out, value);
            }
        }
        Value::String(value) => {
            out.push(TAG_STRING);
            write_string(out, value);
        }
        Value::Integer(value) => {
            out.push(TAG_INTEGER);
            out.write_i64::<LittleEndian>(*value).expect("write to vec");
        }
        Value::Float(value) => {
            out.push(TAG_FLOAT);
            out.write_u64::<LittleEndian>(value.to_bits()).expect("write to vec");
        }
        Value::Boolean(value) => {
            out.push(TAG_BOOLEAN);
            out.push(if *value { 1 } else { 0 });
        }
    }
}
