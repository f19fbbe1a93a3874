//! Serialization capability and its JSON-lines implementation.
//!
//! The pipeline only ever builds a [`Value`] tree; [`render_record`] walks it
//! through any [`LogFormat`]. Formats see a strict begin/item/value/end
//! protocol and reject misuse with [`OutputError::Structure`].

use crate::output::{names::NameResolver, tree::Value, OutputError};
use chrono::{DateTime, SecondsFormat, Utc};
use std::io::Write;

pub trait LogFormat: Send {
    fn record_begin(&mut self) -> Result<(), OutputError>;
    fn record_end(&mut self) -> Result<(), OutputError>;
    fn dict_begin(&mut self) -> Result<(), OutputError>;
    fn dict_end(&mut self) -> Result<(), OutputError>;
    fn dict_item(&mut self, label: &str) -> Result<(), OutputError>;
    fn list_begin(&mut self) -> Result<(), OutputError>;
    fn list_end(&mut self) -> Result<(), OutputError>;
    fn list_item(&mut self) -> Result<(), OutputError>;
    fn value_string(&mut self, s: &str) -> Result<(), OutputError>;
    fn value_int(&mut self, v: i64) -> Result<(), OutputError>;
    fn value_uint(&mut self, v: u64) -> Result<(), OutputError>;
    fn value_bool(&mut self, v: bool) -> Result<(), OutputError>;
    fn value_time(&mut self, t: &DateTime<Utc>) -> Result<(), OutputError>;
    fn value_null(&mut self) -> Result<(), OutputError>;
    fn value_hex(&mut self, bytes: &[u8]) -> Result<(), OutputError>;

    /// Bytes of the finished record; clears the internal buffer.
    fn take(&mut self) -> Vec<u8>;
    /// Discard a partially written record.
    fn reset(&mut self);
}

/// `uid` → `uname`, `euid` → `euname`, `rgid` → `rgname`.
pub fn name_label(id_label: &str) -> String {
    let stem = id_label.strip_suffix("id").unwrap_or(id_label);
    format!("{stem}name")
}

/// Emit one record. The root must be a dict.
pub fn render_record(
    root: &Value,
    fmt: &mut dyn LogFormat,
    names: Option<&dyn NameResolver>,
) -> Result<(), OutputError> {
    let Value::Dict(items) = root else {
        return Err(OutputError::Structure("record root is not a dict"));
    };
    fmt.record_begin()?;
    emit_items(items, fmt, names)?;
    fmt.record_end()
}

fn emit_items(
    items: &[(crate::output::tree::Label, Value)],
    fmt: &mut dyn LogFormat,
    names: Option<&dyn NameResolver>,
) -> Result<(), OutputError> {
    for (label, v) in items {
        fmt.dict_item(label)?;
        emit(v, fmt, names)?;
        let name = match (v, names) {
            (Value::Uid(id), Some(r)) => r.user(*id),
            (Value::Gid(id), Some(r)) => r.group(*id),
            _ => None,
        };
        if let Some(name) = name {
            fmt.dict_item(&name_label(label))?;
            fmt.value_string(&name)?;
        }
    }
    Ok(())
}

fn emit(v: &Value, fmt: &mut dyn LogFormat, names: Option<&dyn NameResolver>) -> Result<(), OutputError> {
    match v {
        Value::Dict(items) => {
            fmt.dict_begin()?;
            emit_items(items, fmt, names)?;
            fmt.dict_end()
        }
        Value::List(items) => {
            fmt.list_begin()?;
            for item in items {
                fmt.list_item()?;
                emit(item, fmt, names)?;
            }
            fmt.list_end()
        }
        Value::Str(s) => fmt.value_string(s),
        Value::Int(i) => fmt.value_int(*i),
        Value::Uint(u) => fmt.value_uint(*u),
        Value::Uid(u) | Value::Gid(u) => fmt.value_uint(u64::from(*u)),
        Value::Bool(b) => fmt.value_bool(*b),
        Value::Time(t) => fmt.value_time(t),
        Value::Null => fmt.value_null(),
        Value::Hex(b) => fmt.value_hex(b),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Dict,
    List,
}

#[derive(Debug)]
struct Frame {
    kind:     FrameKind,
    items:    usize,
    awaiting: bool,
}

/// One JSON object per line.
#[derive(Debug, Default)]
pub struct JsonFormat {
    buf:   Vec<u8>,
    stack: Vec<Frame>,
}

impl JsonFormat {
    pub fn new() -> Self {
        Self::default()
    }

    fn top(&mut self) -> Result<&mut Frame, OutputError> {
        self.stack.last_mut().ok_or(OutputError::Structure("no open record"))
    }

    /// Claim the slot announced by the last item call.
    fn slot(&mut self) -> Result<(), OutputError> {
        let top = self.top()?;
        if !top.awaiting {
            return Err(OutputError::Structure("value without item"));
        }
        top.awaiting = false;
        Ok(())
    }

    fn item(&mut self, kind: FrameKind) -> Result<(), OutputError> {
        let top = self.top()?;
        if top.kind != kind || top.awaiting {
            return Err(OutputError::Structure("item out of place"));
        }
        let first = top.items == 0;
        top.items += 1;
        top.awaiting = true;
        if !first {
            self.buf.push(b',');
        }
        Ok(())
    }

    fn open(&mut self, kind: FrameKind) -> Result<(), OutputError> {
        self.slot()?;
        self.buf.push(if kind == FrameKind::Dict { b'{' } else { b'[' });
        self.stack.push(Frame { kind, items: 0, awaiting: false });
        Ok(())
    }

    fn close(&mut self, kind: FrameKind) -> Result<(), OutputError> {
        if self.stack.len() < 2 {
            return Err(OutputError::Structure("close of record root"));
        }
        match self.stack.pop() {
            Some(f) if f.kind == kind && !f.awaiting => {
                self.buf.push(if kind == FrameKind::Dict { b'}' } else { b']' });
                Ok(())
            }
            _ => Err(OutputError::Structure("mismatched close")),
        }
    }
}

impl LogFormat for JsonFormat {
    fn record_begin(&mut self) -> Result<(), OutputError> {
        if !self.stack.is_empty() {
            return Err(OutputError::Structure("record already open"));
        }
        self.buf.push(b'{');
        self.stack.push(Frame { kind: FrameKind::Dict, items: 0, awaiting: false });
        Ok(())
    }

    fn record_end(&mut self) -> Result<(), OutputError> {
        match self.stack.as_slice() {
            [root] if root.kind == FrameKind::Dict && !root.awaiting => {
                self.stack.clear();
                self.buf.extend_from_slice(b"}\n");
                Ok(())
            }
            _ => Err(OutputError::Structure("record closed with open containers")),
        }
    }

    fn dict_begin(&mut self) -> Result<(), OutputError> {
        self.open(FrameKind::Dict)
    }

    fn dict_end(&mut self) -> Result<(), OutputError> {
        self.close(FrameKind::Dict)
    }

    fn dict_item(&mut self, label: &str) -> Result<(), OutputError> {
        self.item(FrameKind::Dict)?;
        serde_json::to_writer(&mut self.buf, label)?;
        self.buf.push(b':');
        Ok(())
    }

    fn list_begin(&mut self) -> Result<(), OutputError> {
        self.open(FrameKind::List)
    }

    fn list_end(&mut self) -> Result<(), OutputError> {
        self.close(FrameKind::List)
    }

    fn list_item(&mut self) -> Result<(), OutputError> {
        self.item(FrameKind::List)
    }

    fn value_string(&mut self, s: &str) -> Result<(), OutputError> {
        self.slot()?;
        serde_json::to_writer(&mut self.buf, s)?;
        Ok(())
    }

    fn value_int(&mut self, v: i64) -> Result<(), OutputError> {
        self.slot()?;
        write!(self.buf, "{v}")?;
        Ok(())
    }

    fn value_uint(&mut self, v: u64) -> Result<(), OutputError> {
        self.slot()?;
        write!(self.buf, "{v}")?;
        Ok(())
    }

    fn value_bool(&mut self, v: bool) -> Result<(), OutputError> {
        self.slot()?;
        self.buf.extend_from_slice(if v { b"true" } else { b"false" });
        Ok(())
    }

    fn value_time(&mut self, t: &DateTime<Utc>) -> Result<(), OutputError> {
        self.slot()?;
        write!(self.buf, "\"{}\"", t.to_rfc3339_opts(SecondsFormat::Nanos, true))?;
        Ok(())
    }

    fn value_null(&mut self) -> Result<(), OutputError> {
        self.slot()?;
        self.buf.extend_from_slice(b"null");
        Ok(())
    }

    fn value_hex(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
        self.slot()?;
        write!(self.buf, "\"{}\"", hex::encode(bytes))?;
        Ok(())
    }

    fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.stack.clear();
    }
}
