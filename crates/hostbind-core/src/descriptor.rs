//! Static binding metadata. Descriptors carry no runtime behavior; they are
//! validated once when the table is loaded (see [`crate::table`]).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipMode {
    /// The host fully owns the resource; native destruction on finalize.
    Owned,
    /// The native side owns the resource; the proxy never destroys it.
    Borrowed,
    /// Shared ownership mediated by the native object's intrusive count.
    RefCounted,
}

impl OwnershipMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OwnershipMode::Owned => "owned",
            OwnershipMode::Borrowed => "borrowed",
            OwnershipMode::RefCounted => "ref_counted",
        }
    }
}

impl fmt::Display for OwnershipMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    In,
    Out,
    InOut,
}

impl Direction {
    pub fn is_inbound(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    pub fn is_outbound(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

/// How the refcount protocol is dispatched natively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefcountStyle {
    /// `obj->Ref()`
    #[default]
    Methods,
    /// `zbr_ref(obj)`
    Functions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefcountMethods {
    pub incref: String,
    pub decref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peek: Option<String>,
    #[serde(default)]
    pub style: RefcountStyle,
}

impl RefcountMethods {
    pub fn new(incref: &str, decref: &str, peek: Option<&str>) -> Self {
        Self {
            incref: incref.to_string(),
            decref: decref.to_string(),
            peek: peek.map(str::to_string),
            style: RefcountStyle::Methods,
        }
    }

    pub fn functions(mut self) -> Self {
        self.style = RefcountStyle::Functions;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypeDescriptor {
    pub name: String,
    pub ownership_mode: OwnershipMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refcount_methods: Option<RefcountMethods>,
    #[serde(default)]
    pub is_singleton: bool,
    /// The host class can carry custodian registrations (subclassing support).
    #[serde(default = "default_true")]
    pub allow_subclassing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_function: Option<String>,
}

fn default_true() -> bool {
    true
}

impl TypeDescriptor {
    pub fn new(name: &str, ownership_mode: OwnershipMode) -> Self {
        Self {
            name: name.to_string(),
            ownership_mode,
            refcount_methods: None,
            is_singleton: false,
            allow_subclassing: true,
            free_function: None,
        }
    }

    pub fn owned(name: &str) -> Self {
        Self::new(name, OwnershipMode::Owned)
    }

    pub fn borrowed(name: &str) -> Self {
        Self::new(name, OwnershipMode::Borrowed)
    }

    pub fn ref_counted(name: &str, methods: RefcountMethods) -> Self {
        Self::new(name, OwnershipMode::RefCounted).with_refcount_methods(methods)
    }

    pub fn with_refcount_methods(mut self, methods: RefcountMethods) -> Self {
        self.refcount_methods = Some(methods);
        self
    }

    pub fn singleton(mut self) -> Self {
        self.is_singleton = true;
        self
    }

    pub fn without_subclassing(mut self) -> Self {
        self.allow_subclassing = false;
        self
    }

    pub fn with_free_function(mut self, name: &str) -> Self {
        self.free_function = Some(name.to_string());
        self
    }

    /// At most one live proxy per native handle.
    pub fn is_identity_mapped(&self) -> bool {
        self.is_singleton || self.ownership_mode == OwnershipMode::RefCounted
    }

    /// Checks that need nothing but the type itself.
    pub fn validate(&self) -> Vec<ConfigError> {
        let subject = format!("type {}", self.name);
        let mut errors = Vec::new();
        match (&self.refcount_methods, self.ownership_mode) {
            (Some(_), OwnershipMode::RefCounted) => {}
            (Some(_), mode) => errors.push(ConfigError::new(
                ConfigErrorKind::RefcountWithoutRefcountedMode,
                &subject,
                format!("refcount_methods declared but ownership_mode is {mode}"),
            )),
            (None, OwnershipMode::RefCounted) => errors.push(ConfigError::new(
                ConfigErrorKind::RefcountedWithoutMethods,
                &subject,
                "ref_counted type declares no refcount_methods",
            )),
            (None, _) => {}
        }
        if let Some(methods) = &self.refcount_methods {
            let empty = methods.incref.trim().is_empty()
                || methods.decref.trim().is_empty()
                || methods.peek.as_deref().is_some_and(|p| p.trim().is_empty());
            if empty {
                errors.push(ConfigError::new(
                    ConfigErrorKind::RefcountedWithoutMethods,
                    &subject,
                    "refcount method names must not be empty",
                ));
            }
        }
        if self.free_function.is_some() && self.ownership_mode != OwnershipMode::Owned {
            errors.push(ConfigError::new(
                ConfigErrorKind::FreeFunctionMisplaced,
                &subject,
                format!(
                    "free_function only applies to owned types, not {}",
                    self.ownership_mode
                ),
            ));
        }
        errors
    }
}

/// Per parameter or return value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValueDescriptor {
    /// Wrapped type; `None` for plain values that never get a proxy.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub transfer_ownership: bool,
    #[serde(default)]
    pub caller_owns_return: bool,
    #[serde(default)]
    pub reference_existing_object: bool,
    #[serde(default)]
    pub return_internal_reference: bool,
    /// 0 = receiver, k = parameter k, -1 = return value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custodian: Option<i32>,
}

impl ValueDescriptor {
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn of(type_name: &str) -> Self {
        Self {
            type_name: Some(type_name.to_string()),
            ..Self::default()
        }
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn transfer(mut self) -> Self {
        self.transfer_ownership = true;
        self
    }

    pub fn caller_owns(mut self) -> Self {
        self.caller_owns_return = true;
        self
    }

    pub fn reference_existing(mut self) -> Self {
        self.reference_existing_object = true;
        self
    }

    pub fn internal_reference(mut self) -> Self {
        self.return_internal_reference = true;
        self
    }

    pub fn custodian(mut self, index: i32) -> Self {
        self.custodian = Some(index);
        self
    }

    pub fn is_wrapped(&self) -> bool {
        self.type_name.is_some()
    }

    /// The value aliases a resource owned elsewhere.
    pub fn aliases_existing(&self) -> bool {
        self.reference_existing_object || self.return_internal_reference
    }

    /// Ownership is handed to the receiving side at this crossing.
    pub fn hands_over(&self) -> bool {
        self.transfer_ownership || self.caller_owns_return
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Constructor,
    #[default]
    Method,
    Function,
}

impl CallKind {
    pub fn has_receiver(self) -> bool {
        self == CallKind::Method
    }
}

/// One boundary-crossing operation, keyed by `(owner, signature)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallDescriptor {
    /// Type the operation belongs to; free functions use their module name.
    pub owner: String,
    pub signature: String,
    #[serde(default)]
    pub kind: CallKind,
    #[serde(default)]
    pub params: Vec<ValueDescriptor>,
    #[serde(default, rename = "return", skip_serializing_if = "Option::is_none")]
    pub ret: Option<ValueDescriptor>,
    /// Native error signatures the call may raise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub throws: Vec<String>,
}

impl CallDescriptor {
    pub fn new(owner: &str, signature: &str, kind: CallKind) -> Self {
        Self {
            owner: owner.to_string(),
            signature: signature.to_string(),
            kind,
            params: Vec::new(),
            ret: None,
            throws: Vec::new(),
        }
    }

    pub fn method(owner: &str, signature: &str) -> Self {
        Self::new(owner, signature, CallKind::Method)
    }

    pub fn function(owner: &str, signature: &str) -> Self {
        Self::new(owner, signature, CallKind::Function)
    }

    /// Constructors return the freshly built owner object.
    pub fn constructor(owner: &str, signature: &str) -> Self {
        let mut call = Self::new(owner, signature, CallKind::Constructor);
        call.ret = Some(ValueDescriptor::of(owner));
        call
    }

    pub fn param(mut self, value: ValueDescriptor) -> Self {
        self.params.push(value);
        self
    }

    pub fn returns(mut self, value: ValueDescriptor) -> Self {
        self.ret = Some(value);
        self
    }

    pub fn throws(mut self, signature: &str) -> Self {
        self.throws.push(signature.to_string());
        self
    }

    pub fn label(&self) -> String {
        format!("{}::{}", self.owner, self.signature)
    }
}

/// A native error signature and where it sits in the error hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Kind reported on the host error, e.g. `DomainError`.
    pub host_kind: String,
}

impl ErrorDescriptor {
    pub fn new(name: &str, host_kind: &str) -> Self {
        Self {
            name: name.to_string(),
            parent: None,
            host_kind: host_kind.to_string(),
        }
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = Some(parent.to_string());
        self
    }
}
