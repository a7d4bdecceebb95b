use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::ProtocolError;
use crate::types::{parse_datetime, DATETIME_FORMAT};
use crate::value::{Map, Value};
use crate::Event;

/// Receiver of structural events, the writing side of the wire.
pub trait EventSink {
    fn open(&mut self, name: &str);
    fn close(&mut self, name: &str);
    fn text(&mut self, chars: &str);
}

impl EventSink for Vec<Event> {
    fn open(&mut self, name: &str) {
        self.push(Event::open(name));
    }

    fn close(&mut self, name: &str) {
        self.push(Event::close(name));
    }

    fn text(&mut self, chars: &str) {
        self.push(Event::text(chars));
    }
}

/// Writes method calls and values as structural events.
#[derive(Debug, Default)]
pub struct Formatter<S> {
    sink: S,
}

impl<S: EventSink> Formatter<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn into_inner(self) -> S {
        self.sink
    }

    /// Emits a complete `methodCall` envelope with one `param` per value.
    pub fn method_call(&mut self, method: &str, params: &[Value]) {
        self.sink.open("methodCall");
        self.element("methodName", method);
        self.sink.open("params");
        for param in params {
            self.sink.open("param");
            self.value(param);
            self.sink.close("param");
        }
        self.sink.close("params");
        self.sink.close("methodCall");
    }

    pub fn value(&mut self, value: &Value) {
        self.sink.open("value");
        match value {
            Value::Nil => {
                self.sink.open("nil");
                self.sink.close("nil");
            }
            Value::Bool(b) => self.element("boolean", if *b { "1" } else { "0" }),
            Value::Int(n) => match i32::try_from(*n) {
                Ok(_) => self.element("int", &n.to_string()),
                Err(_) => self.element("i8", &n.to_string()),
            },
            Value::Double(d) => self.element("double", &d.to_string()),
            Value::String(s) => self.element("string", s),
            Value::Binary(b) => self.element("base64", &STANDARD.encode(b)),
            Value::DateTime(dt) => {
                self.element("dateTime.iso8601", &dt.format(DATETIME_FORMAT).to_string())
            }
            Value::Array(items) => {
                self.sink.open("array");
                self.sink.open("data");
                for item in items {
                    self.value(item);
                }
                self.sink.close("data");
                self.sink.close("array");
            }
            Value::Struct(members) => {
                self.sink.open("struct");
                for (name, member) in members {
                    self.sink.open("member");
                    self.element("name", name);
                    self.value(member);
                    self.sink.close("member");
                }
                self.sink.close("struct");
            }
        }
        self.sink.close("value");
    }

    fn element(&mut self, name: &str, text: &str) {
        self.sink.open(name);
        if !text.is_empty() {
            self.sink.text(text);
        }
        self.sink.close(name);
    }
}

/// Progress of the value currently being scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// No `value` element has been opened yet.
    Idle,
    InProgress,
    /// The outermost `value` element has closed.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    Int,
    Bool,
    Double,
    Str,
    Base64,
    DateTime,
    Nil,
}

impl Scalar {
    fn from_tag(tag: &str) -> Option<(Self, &'static str)> {
        let found = match tag {
            "i4" => (Scalar::Int, "i4"),
            "int" => (Scalar::Int, "int"),
            "i8" => (Scalar::Int, "i8"),
            "ex:i8" => (Scalar::Int, "ex:i8"),
            "boolean" => (Scalar::Bool, "boolean"),
            "double" => (Scalar::Double, "double"),
            "string" => (Scalar::Str, "string"),
            "base64" => (Scalar::Base64, "base64"),
            "dateTime.iso8601" => (Scalar::DateTime, "dateTime.iso8601"),
            "nil" => (Scalar::Nil, "nil"),
            "ex:nil" => (Scalar::Nil, "ex:nil"),
            _ => return None,
        };
        Some(found)
    }

    fn parse(self, tag: &'static str, text: String) -> Result<Value, ProtocolError> {
        let invalid = |text: String| ProtocolError::InvalidScalar { kind: tag, text };
        match self {
            Scalar::Int => match text.trim().parse::<i64>() {
                Ok(n) => Ok(Value::Int(n)),
                Err(_) => Err(invalid(text)),
            },
            Scalar::Bool => match text.trim() {
                "1" | "true" => Ok(Value::Bool(true)),
                "0" | "false" => Ok(Value::Bool(false)),
                _ => Err(invalid(text)),
            },
            Scalar::Double => match text.trim().parse::<f64>() {
                Ok(d) => Ok(Value::Double(d)),
                Err(_) => Err(invalid(text)),
            },
            Scalar::Str => Ok(Value::String(text)),
            Scalar::Base64 => {
                let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                match STANDARD.decode(compact) {
                    Ok(bytes) => Ok(Value::Binary(bytes)),
                    Err(_) => Err(invalid(text)),
                }
            }
            Scalar::DateTime => match parse_datetime(&text) {
                Some(dt) => Ok(Value::DateTime(dt)),
                None => Err(invalid(text)),
            },
            Scalar::Nil if text.trim().is_empty() => Ok(Value::Nil),
            Scalar::Nil => Err(invalid(text)),
        }
    }
}

/// One open element of the value under construction.
#[derive(Debug)]
enum Frame {
    Value { text: String, inner: Option<Value> },
    Scalar { kind: Scalar, tag: &'static str, text: String },
    Array { items: Vec<Value>, in_data: bool },
    Struct { members: Map },
    Member { name: Option<String>, value: Option<Value> },
    Name { text: String },
}

/// Incrementally rebuilds one `value` subtree from structural events.
///
/// Nested arrays and structs each get a frame on the stack; a frame's
/// finished value is handed to its parent only when the frame closes.
#[derive(Debug, Default)]
pub struct Scanner {
    stack: Vec<Frame>,
    complete: Option<Value>,
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discards any partial or finished value.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.complete = None;
    }

    pub fn state(&self) -> ScanState {
        if self.complete.is_some() {
            ScanState::Complete
        } else if self.stack.is_empty() {
            ScanState::Idle
        } else {
            ScanState::InProgress
        }
    }

    /// Takes the finished value, leaving the scanner idle.
    pub fn take(&mut self) -> Option<Value> {
        self.complete.take()
    }

    pub fn feed(&mut self, event: &Event) -> Result<(), ProtocolError> {
        if self.complete.is_some() {
            return if event.is_blank() {
                Ok(())
            } else {
                Err(ProtocolError::UnexpectedInValue(event.clone()))
            };
        }

        match event {
            Event::Open(name) => self.open(name, event),
            Event::Close(name) => self.close(name, event),
            Event::Text(chars) => self.text(chars, event),
        }
    }

    fn open(&mut self, name: &str, event: &Event) -> Result<(), ProtocolError> {
        let unexpected = || ProtocolError::UnexpectedInValue(event.clone());

        let frame = match (self.stack.last_mut(), name) {
            (None, "value")
            | (Some(Frame::Array { in_data: true, .. }), "value")
            | (Some(Frame::Member { name: Some(_), value: None }), "value") => Frame::Value {
                text: String::new(),
                inner: None,
            },
            (Some(Frame::Value { text, inner: None }), _) if text.trim().is_empty() => {
                match name {
                    "array" => Frame::Array {
                        items: Vec::new(),
                        in_data: false,
                    },
                    "struct" => Frame::Struct {
                        members: Map::new(),
                    },
                    _ => {
                        let (kind, tag) = Scalar::from_tag(name).ok_or_else(unexpected)?;
                        Frame::Scalar {
                            kind,
                            tag,
                            text: String::new(),
                        }
                    }
                }
            }
            (Some(Frame::Array { items, in_data }), "data") if !*in_data && items.is_empty() => {
                *in_data = true;
                return Ok(());
            }
            (Some(Frame::Struct { .. }), "member") => Frame::Member {
                name: None,
                value: None,
            },
            (Some(Frame::Member { name: None, .. }), "name") => Frame::Name {
                text: String::new(),
            },
            _ => return Err(unexpected()),
        };

        self.stack.push(frame);
        Ok(())
    }

    fn text(&mut self, chars: &str, event: &Event) -> Result<(), ProtocolError> {
        match self.stack.last_mut() {
            Some(Frame::Value { text, inner: None }) => text.push_str(chars),
            Some(Frame::Scalar { text, .. }) | Some(Frame::Name { text }) => text.push_str(chars),
            _ if event.is_blank() => {}
            _ => return Err(ProtocolError::UnexpectedInValue(event.clone())),
        }
        Ok(())
    }

    fn close(&mut self, name: &str, event: &Event) -> Result<(), ProtocolError> {
        let unexpected = || ProtocolError::UnexpectedInValue(event.clone());

        let finished = match (self.stack.last_mut(), name) {
            (Some(Frame::Array { in_data, .. }), "data") if *in_data => {
                *in_data = false;
                return Ok(());
            }
            (Some(Frame::Scalar { tag, .. }), _) if *tag == name => match self.stack.pop() {
                Some(Frame::Scalar { kind, tag, text }) => kind.parse(tag, text)?,
                _ => return Err(unexpected()),
            },
            (Some(Frame::Array { in_data: false, .. }), "array") => match self.stack.pop() {
                Some(Frame::Array { items, .. }) => Value::Array(items),
                _ => return Err(unexpected()),
            },
            (Some(Frame::Struct { .. }), "struct") => match self.stack.pop() {
                Some(Frame::Struct { members }) => Value::Struct(members),
                _ => return Err(unexpected()),
            },
            (Some(Frame::Name { .. }), "name") => {
                if let Some(Frame::Name { text }) = self.stack.pop() {
                    if let Some(Frame::Member { name, .. }) = self.stack.last_mut() {
                        *name = Some(text);
                    }
                }
                return Ok(());
            }
            (Some(Frame::Member { name: Some(_), value: Some(_) }), "member") => {
                if let Some(Frame::Member {
                    name: Some(name),
                    value: Some(value),
                }) = self.stack.pop()
                {
                    if let Some(Frame::Struct { members }) = self.stack.last_mut() {
                        members.insert(name, value);
                    }
                }
                return Ok(());
            }
            (Some(Frame::Value { .. }), "value") => {
                let value = match self.stack.pop() {
                    Some(Frame::Value { inner: Some(v), .. }) => v,
                    Some(Frame::Value { text, inner: None }) => Value::String(text),
                    _ => return Err(unexpected()),
                };
                self.finish_value(value);
                return Ok(());
            }
            _ => return Err(unexpected()),
        };

        // A typed child of a `value` element finished.
        match self.stack.last_mut() {
            Some(Frame::Value { inner, .. }) => {
                *inner = Some(finished);
                Ok(())
            }
            _ => Err(unexpected()),
        }
    }

    fn finish_value(&mut self, value: Value) {
        match self.stack.last_mut() {
            None => self.complete = Some(value),
            Some(Frame::Array { items, .. }) => items.push(value),
            Some(Frame::Member { value: slot, .. }) => *slot = Some(value),
            // `open` only admits a value under the three parents above.
            Some(_) => {}
        }
    }
}
