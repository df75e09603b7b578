//! Input requests and the thread-safe queue they travel through.
//!
//! Requests are plain data: they name values as literals, existing symbols or
//! placeholders for identifiers the reasoner creates when it applies the batch
//! at the start of the INPUT phase.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::symbol::{Literal, Symbol};

/// A value in an input request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputValue {
    /// An existing symbol, such as the input-link identifier.
    Symbol(Symbol),
    Literal(Literal),
    /// A new identifier. Requests in the same batch that use the same key
    /// share one identifier.
    NewId { letter: char, key: String },
}

impl InputValue {
    pub fn new_id(letter: char, key: impl Into<String>) -> Self {
        InputValue::NewId {
            letter,
            key: key.into(),
        }
    }
}

impl From<Symbol> for InputValue {
    fn from(sym: Symbol) -> Self {
        InputValue::Symbol(sym)
    }
}

impl From<&str> for InputValue {
    fn from(s: &str) -> Self {
        InputValue::Literal(Literal::from(s))
    }
}

impl From<i64> for InputValue {
    fn from(i: i64) -> Self {
        InputValue::Literal(Literal::Int(i))
    }
}

impl From<f64> for InputValue {
    fn from(x: f64) -> Self {
        InputValue::Literal(Literal::Float(x))
    }
}

/// A change to input-supported working memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum InputRequest {
    Add {
        id: InputValue,
        attr: InputValue,
        value: InputValue,
    },
    /// Remove the input element with this triple, if any.
    Remove {
        id: InputValue,
        attr: InputValue,
        value: InputValue,
    },
}

impl InputRequest {
    pub fn add(
        id: impl Into<InputValue>,
        attr: impl Into<InputValue>,
        value: impl Into<InputValue>,
    ) -> Self {
        InputRequest::Add {
            id: id.into(),
            attr: attr.into(),
            value: value.into(),
        }
    }

    pub fn remove(
        id: impl Into<InputValue>,
        attr: impl Into<InputValue>,
        value: impl Into<InputValue>,
    ) -> Self {
        InputRequest::Remove {
            id: id.into(),
            attr: attr.into(),
            value: value.into(),
        }
    }
}

/// Mutex-guarded request queue. Clones share the same queue.
#[derive(Debug, Clone, Default)]
pub struct InputQueue {
    requests: Arc<Mutex<Vec<InputRequest>>>,
}

impl InputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: InputRequest) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
    }

    pub fn extend(&self, requests: impl IntoIterator<Item = InputRequest>) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(requests);
    }

    /// Take every pending request in submission order.
    pub fn drain(&self) -> Vec<InputRequest> {
        std::mem::take(&mut *self.requests.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_is_shared_across_threads() {
        let queue = InputQueue::new();
        let handles: Vec<_> = (0..4i64)
            .map(|i| {
                let q = queue.clone();
                std::thread::spawn(move || q.push(InputRequest::add("x", "n", i)))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(queue.len(), 4);
        assert_eq!(queue.drain().len(), 4);
        assert!(queue.is_empty());
    }

    #[test]
    fn request_serializes_with_op_tag() {
        let req = InputRequest::add(InputValue::new_id('B', "block"), "color", "red");
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"op\":\"add\""));
        let back: InputRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }
}
