//! Key templates for cache entries and lock leases.
//!
//! Call sites describe the key they operate on with a small template such as
//! `"stock-{productId}"` or `"order:{result.id}"`. A template is parsed once
//! (parse errors surface where the template is declared) and resolved per
//! call against a [`KeyContext`] holding the call's named arguments and,
//! after the operation ran, its result.
//!
//! # Template syntax
//!
//! - `{name}` inserts the argument bound as `name`
//! - `{name.field.0}` walks into objects (by field) and arrays (by index)
//! - `{result}` / `{result.field}` refer to the operation's result
//! - `{{` and `}}` insert literal braces
//!
//! Strings are inserted without quotes, numbers and booleans in their display
//! form and `null` as `null`. Objects and arrays cannot be rendered into a key.
//!
//! # Example
//!
//! ```
//! use fleet_sync_core::key::{KeyContext, KeyTemplate};
//!
//! let template = KeyTemplate::parse("stock-{productId}").unwrap();
//! let ctx = KeyContext::new().with_arg("productId", 42);
//! assert_eq!(template.resolve(&ctx).unwrap(), "stock-42");
//! ```

use serde::Serialize;
use serde_json::Value;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Placeholder root that refers to the operation's result.
pub const RESULT_BINDING: &str = "result";

/// Errors produced while parsing or resolving a key expression.
///
/// These are programming errors at the call site, never runtime conditions
/// of the cache or lock backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// A `{` was opened but never closed.
    #[error("Unterminated placeholder at byte {position} in '{template}'")]
    UnterminatedPlaceholder {
        /// The template being parsed
        template: String,
        /// Byte offset of the opening brace
        position: usize,
    },

    /// A `}` appeared outside a placeholder without being escaped.
    #[error("Unmatched '}}' at byte {position} in '{template}'")]
    UnmatchedBrace {
        /// The template being parsed
        template: String,
        /// Byte offset of the stray brace
        position: usize,
    },

    /// Placeholder name is empty or contains characters outside `[A-Za-z0-9_.]`.
    #[error("Invalid placeholder '{{{name}}}' in '{template}'")]
    InvalidPlaceholder {
        /// The template being parsed
        template: String,
        /// The offending placeholder body
        name: String,
    },

    /// No argument is bound under the placeholder's root name.
    #[error("No argument bound for placeholder '{0}'")]
    MissingArgument(String),

    /// A nested field or index does not exist in the bound value.
    #[error("Field '{field}' not found while resolving '{path}'")]
    MissingField {
        /// Full placeholder path
        path: String,
        /// The path component that could not be found
        field: String,
    },

    /// The placeholder refers to the result, but no result is bound.
    #[error("Placeholder '{0}' refers to the result, which is not available here")]
    ResultUnavailable(String),

    /// The placeholder resolved to an object or array.
    #[error("Placeholder '{path}' resolved to a non-scalar value")]
    NonScalar {
        /// Full placeholder path
        path: String,
    },

    /// An argument could not be converted to a bindable value.
    #[error("Failed to bind argument '{name}': {reason}")]
    Binding {
        /// Argument name
        name: String,
        /// Serialization failure
        reason: String,
    },

    /// A caller-supplied key function rejected its input.
    #[error("Key function failed: {0}")]
    Computed(String),
}

/// Named bindings a key is resolved against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyContext {
    args: BTreeMap<String, Value>,
    result: Option<Value>,
}

impl KeyContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a scalar (or any `serde_json::Value`) argument.
    #[must_use]
    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    /// Bind a structured argument by serializing it to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Binding`] if the value cannot be serialized.
    pub fn with_serialized_arg<T: Serialize + ?Sized>(
        self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, KeyError> {
        let name = name.into();
        let value = serde_json::to_value(value).map_err(|e| KeyError::Binding {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        Ok(self.with_arg(name, value))
    }

    /// Bind the operation's result.
    #[must_use]
    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Look up an argument by name.
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }

    /// The bound result, if any.
    #[must_use]
    pub const fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }
}

/// Dotted path inside a placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Path {
    raw: String,
    parts: SmallVec<[String; 2]>,
}

impl Path {
    fn parse(template: &str, body: &str) -> Result<Self, KeyError> {
        let invalid = || KeyError::InvalidPlaceholder {
            template: template.to_string(),
            name: body.to_string(),
        };

        let mut parts = SmallVec::new();
        for part in body.split('.') {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(invalid());
            }
            parts.push(part.to_string());
        }

        Ok(Self {
            raw: body.to_string(),
            parts,
        })
    }

    fn root(&self) -> &str {
        self.parts.first().map_or("", String::as_str)
    }

    fn lookup<'c>(&self, ctx: &'c KeyContext) -> Result<&'c Value, KeyError> {
        let root = self.root();
        let mut current = if root == RESULT_BINDING {
            ctx.result
                .as_ref()
                .ok_or_else(|| KeyError::ResultUnavailable(self.raw.clone()))?
        } else {
            ctx.args
                .get(root)
                .ok_or_else(|| KeyError::MissingArgument(self.raw.clone()))?
        };

        for field in self.parts.iter().skip(1) {
            let next = match current {
                Value::Object(map) => map.get(field.as_str()),
                Value::Array(items) => field.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            current = next.ok_or_else(|| KeyError::MissingField {
                path: self.raw.clone(),
                field: field.clone(),
            })?;
        }

        Ok(current)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(Path),
}

/// A parsed key template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyTemplate {
    source: String,
    segments: SmallVec<[Segment; 4]>,
}

impl KeyTemplate {
    /// Parse a template.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::UnterminatedPlaceholder`], [`KeyError::UnmatchedBrace`]
    /// or [`KeyError::InvalidPlaceholder`] for malformed templates.
    pub fn parse(template: &str) -> Result<Self, KeyError> {
        let mut segments = SmallVec::new();
        let mut literal = String::new();
        let mut chars = template.char_indices().peekable();

        while let Some((position, ch)) = chars.next() {
            match ch {
                '{' => {
                    if chars.next_if(|&(_, c)| c == '{').is_some() {
                        literal.push('{');
                        continue;
                    }

                    let mut body = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        body.push(c);
                    }
                    if !closed {
                        return Err(KeyError::UnterminatedPlaceholder {
                            template: template.to_string(),
                            position,
                        });
                    }

                    let path = Path::parse(template, &body)?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(path));
                },
                '}' => {
                    if chars.next_if(|&(_, c)| c == '}').is_none() {
                        return Err(KeyError::UnmatchedBrace {
                            template: template.to_string(),
                            position,
                        });
                    }
                    literal.push('}');
                },
                other => literal.push(other),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    /// A template that always resolves to `key`, braces included.
    #[must_use]
    pub fn literal(key: impl Into<String>) -> Self {
        let key = key.into();
        let mut segments = SmallVec::new();
        if !key.is_empty() {
            segments.push(Segment::Literal(key.clone()));
        }
        Self {
            source: key.replace('{', "{{").replace('}', "}}"),
            segments,
        }
    }

    /// The template text as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Names (full dotted paths) of all placeholders, in order of appearance.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Placeholder(path) => Some(path.raw.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Whether any placeholder refers to the operation's result.
    #[must_use]
    pub fn references_result(&self) -> bool {
        self.segments.iter().any(|segment| {
            matches!(segment, Segment::Placeholder(path) if path.root() == RESULT_BINDING)
        })
    }

    /// Resolve the template against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns a [`KeyError`] if a placeholder is unbound, walks into a missing
    /// field, or resolves to an object or array.
    pub fn resolve(&self, ctx: &KeyContext) -> Result<String, KeyError> {
        let mut key = String::with_capacity(self.source.len() + 16);

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => key.push_str(text),
                Segment::Placeholder(path) => match path.lookup(ctx)? {
                    Value::String(s) => key.push_str(s),
                    Value::Number(n) => key.push_str(&n.to_string()),
                    Value::Bool(b) => key.push_str(if *b { "true" } else { "false" }),
                    Value::Null => key.push_str("null"),
                    Value::Array(_) | Value::Object(_) => {
                        return Err(KeyError::NonScalar {
                            path: path.raw.clone(),
                        });
                    },
                },
            }
        }

        Ok(key)
    }
}

impl FromStr for KeyTemplate {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Signature of a caller-supplied key function.
pub type KeyFn = dyn Fn(&KeyContext) -> Result<String, KeyError> + Send + Sync;

/// How a call site derives its key: a template or a closure.
#[derive(Clone)]
pub enum KeyExpression {
    /// Placeholder template, resolved by substitution.
    Template(KeyTemplate),
    /// Arbitrary key function supplied by the call site.
    Computed(Arc<KeyFn>),
}

impl KeyExpression {
    /// Parse a template expression.
    ///
    /// # Errors
    ///
    /// See [`KeyTemplate::parse`].
    pub fn parse(template: &str) -> Result<Self, KeyError> {
        KeyTemplate::parse(template).map(Self::Template)
    }

    /// Wrap a key function.
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&KeyContext) -> Result<String, KeyError> + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    /// A fixed key.
    #[must_use]
    pub fn literal(key: impl Into<String>) -> Self {
        Self::Template(KeyTemplate::literal(key))
    }

    /// Whether resolution may need the result binding.
    ///
    /// Key functions are opaque, so they are assumed to need it.
    #[must_use]
    pub fn references_result(&self) -> bool {
        match self {
            Self::Template(template) => template.references_result(),
            Self::Computed(_) => true,
        }
    }

    /// Resolve the expression against `ctx`.
    ///
    /// # Errors
    ///
    /// Propagates template resolution errors or the key function's error.
    pub fn resolve(&self, ctx: &KeyContext) -> Result<String, KeyError> {
        match self {
            Self::Template(template) => template.resolve(ctx),
            Self::Computed(f) => f(ctx),
        }
    }
}

impl fmt::Debug for KeyExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Template(template) => f.debug_tuple("Template").field(&template.source).finish(),
            Self::Computed(_) => write!(f, "Computed(<fn>)"),
        }
    }
}

impl From<KeyTemplate> for KeyExpression {
    fn from(template: KeyTemplate) -> Self {
        Self::Template(template)
    }
}
