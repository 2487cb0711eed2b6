// Copyright 2020 Joyent, Inc.

//! Remote-callable procedures.
//!
//! The server builds one [`CallMethodDescriptor`] per registered procedure
//! from its declared signature, assigns it a small numeric id and publishes
//! it. Clients fetch a descriptor once by class and method name, cache it,
//! and call by id afterwards.
//!
//! Parameter and return values are either codec-known primitives or custom
//! structures. A structure travels as a positional array of its primitive
//! fields and is handed to procedures (and returned to callers) as a JSON
//! object keyed by field name.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::cancel::RequestScope;
use crate::error::Fault;
use crate::messages::validate_identifier;
use crate::protocol::RequestId;

/// Boxed future returned by procedures.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Caller role, ordered from least to most privileged.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    User,
    Developer,
    Admin,
}

impl Default for Role {
    fn default() -> Self {
        Role::User
    }
}

/// Value types the codec understands directly.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveType {
    Bool,
    Int,
    Long,
    Float,
    Double,
    String,
    Bytes,
    Vector2,
    Vector3,
    Color,
    DateTime,
    Json,
}

impl PrimitiveType {
    /// Check that `value` is a well-formed instance of this type.
    pub fn check(self, value: &Value) -> Result<(), String> {
        let ok = match self {
            PrimitiveType::Bool => value.is_boolean(),
            PrimitiveType::Int => value
                .as_i64()
                .map_or(false, |v| v >= i64::from(i32::min_value()) && v <= i64::from(i32::max_value())),
            PrimitiveType::Long => value.is_i64() || value.is_u64(),
            PrimitiveType::Float | PrimitiveType::Double => value.is_number(),
            PrimitiveType::String => value.is_string(),
            PrimitiveType::Bytes => value.as_array().map_or(false, |items| {
                items.iter().all(|b| b.as_u64().map_or(false, |b| b <= 255))
            }),
            PrimitiveType::Vector2 => is_number_array(value, 2),
            PrimitiveType::Vector3 => is_number_array(value, 3),
            PrimitiveType::Color => is_number_array(value, 4),
            PrimitiveType::DateTime => value
                .as_str()
                .map_or(false, |s| s.parse::<DateTime<Utc>>().is_ok()),
            PrimitiveType::Json => true,
        };

        if ok {
            Ok(())
        } else {
            Err(format!("expected {:?}, got {}", self, value))
        }
    }
}

fn is_number_array(value: &Value, len: usize) -> bool {
    value
        .as_array()
        .map_or(false, |items| items.len() == len && items.iter().all(Value::is_number))
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: PrimitiveType,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParameterKind {
    Primitive {
        ty: PrimitiveType,
    },
    Structure {
        type_name: String,
        fields: Vec<FieldDescriptor>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParameterDescriptor {
    pub name: String,
    pub kind: ParameterKind,
}

impl ParameterDescriptor {
    /// Turn a caller-level value into its wire form.
    pub fn encode(&self, value: &Value) -> Result<Value, String> {
        match &self.kind {
            ParameterKind::Primitive { ty } => {
                ty.check(value).map_err(|e| format!("{}: {}", self.name, e))?;
                Ok(value.clone())
            }
            ParameterKind::Structure { type_name, fields } => {
                let object = value.as_object().ok_or_else(|| {
                    format!("{}: expected a {} object, got {}", self.name, type_name, value)
                })?;
                let mut wire = Vec::with_capacity(fields.len());
                for field in fields {
                    let v = object.get(&field.name).ok_or_else(|| {
                        format!("{}: missing field {}.{}", self.name, type_name, field.name)
                    })?;
                    field
                        .ty
                        .check(v)
                        .map_err(|e| format!("{}.{}: {}", self.name, field.name, e))?;
                    wire.push(v.clone());
                }
                Ok(Value::Array(wire))
            }
        }
    }

    /// Turn a wire value back into its caller-level form.
    pub fn decode(&self, wire: &Value) -> Result<Value, String> {
        match &self.kind {
            ParameterKind::Primitive { ty } => {
                ty.check(wire).map_err(|e| format!("{}: {}", self.name, e))?;
                Ok(wire.clone())
            }
            ParameterKind::Structure { type_name, fields } => {
                let items = match wire.as_array() {
                    Some(items) if items.len() == fields.len() => items,
                    _ => {
                        return Err(format!(
                            "{}: expected {} positional fields of {}, got {}",
                            self.name,
                            fields.len(),
                            type_name,
                            wire
                        ))
                    }
                };
                let mut object = Map::new();
                for (field, v) in fields.iter().zip(items) {
                    field
                        .ty
                        .check(v)
                        .map_err(|e| format!("{}.{}: {}", self.name, field.name, e))?;
                    object.insert(field.name.clone(), v.clone());
                }
                Ok(Value::Object(object))
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CallMethodDescriptor {
    pub id: u32,
    pub class_name: String,
    pub method_name: String,
    pub inputs: Vec<ParameterDescriptor>,
    pub output: Option<ParameterDescriptor>,
    pub role: Role,
    pub is_command: bool,
    pub description: String,
}

impl CallMethodDescriptor {
    /// Marshal positional caller-level arguments for the wire.
    pub fn encode_args(&self, args: &[Value]) -> Result<Vec<Value>, String> {
        if args.len() != self.inputs.len() {
            return Err(format!(
                "{}.{} takes {} arguments, {} supplied",
                self.class_name,
                self.method_name,
                self.inputs.len(),
                args.len()
            ));
        }
        self.inputs
            .iter()
            .zip(args)
            .map(|(p, v)| p.encode(v))
            .collect()
    }

    pub fn decode_args(&self, wire: &[Value]) -> Result<Vec<Value>, String> {
        if wire.len() != self.inputs.len() {
            return Err(format!(
                "{}.{} takes {} arguments, {} supplied",
                self.class_name,
                self.method_name,
                self.inputs.len(),
                wire.len()
            ));
        }
        self.inputs
            .iter()
            .zip(wire)
            .map(|(p, v)| p.decode(v))
            .collect()
    }
}

/// Type of a procedure parameter or return value as declared by the code
/// that discovered it. Only primitives and flat structures of primitives
/// can be registered.
#[derive(Debug, Clone, PartialEq)]
pub enum DeclaredType {
    Void,
    Primitive(PrimitiveType),
    Structure {
        type_name: String,
        fields: Vec<(String, DeclaredType)>,
    },
    /// Connection or caller handle supplied by the server, never sent.
    CallerContext,
    ByRef(Box<DeclaredType>),
    Out(Box<DeclaredType>),
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredParam {
    pub name: String,
    pub ty: DeclaredType,
}

impl DeclaredParam {
    pub fn new<S: Into<String>>(name: S, ty: DeclaredType) -> DeclaredParam {
        DeclaredParam {
            name: name.into(),
            ty,
        }
    }
}

/// Information about the caller handed to every procedure.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub request_id: RequestId,
    pub role: Role,
    pub scope: RequestScope,
}

impl CallContext {
    /// True once the caller abandoned the call or disconnected.
    pub fn is_cancelled(&self) -> bool {
        self.scope.should_stop()
    }
}

/// Failure raised by a procedure itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureError {
    pub message: String,
    pub trace: Option<String>,
}

impl ProcedureError {
    pub fn new<S: Into<String>>(message: S) -> ProcedureError {
        ProcedureError {
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace<S: Into<String>>(mut self, trace: S) -> ProcedureError {
        self.trace = Some(trace.into());
        self
    }
}

impl fmt::Display for ProcedureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.trace {
            Some(trace) => write!(f, "{}\n{}", self.message, trace),
            None => write!(f, "{}", self.message),
        }
    }
}

/// A remote-callable procedure. Arguments arrive decoded, in declaration
/// order; the returned value is ignored for `Void` methods.
pub trait Procedure: Send + Sync + 'static {
    fn invoke(&self, ctx: CallContext, args: Vec<Value>) -> BoxFuture<'static, Result<Value, ProcedureError>>;
}

impl<F, Fut> Procedure for F
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ProcedureError>> + Send + 'static,
{
    fn invoke(&self, ctx: CallContext, args: Vec<Value>) -> BoxFuture<'static, Result<Value, ProcedureError>> {
        Box::pin((self)(ctx, args))
    }
}

/// A procedure as yielded by discovery, before validation.
pub struct MethodCandidate {
    pub class_name: String,
    pub method_name: String,
    pub params: Vec<DeclaredParam>,
    pub returns: DeclaredType,
    pub role: Role,
    pub is_command: bool,
    pub description: String,
    pub procedure: Arc<dyn Procedure>,
}

impl MethodCandidate {
    pub fn new<C, M, P>(class_name: C, method_name: M, procedure: P) -> MethodCandidate
    where
        C: Into<String>,
        M: Into<String>,
        P: Procedure,
    {
        MethodCandidate {
            class_name: class_name.into(),
            method_name: method_name.into(),
            params: Vec::new(),
            returns: DeclaredType::Void,
            role: Role::Guest,
            is_command: false,
            description: String::new(),
            procedure: Arc::new(procedure),
        }
    }

    pub fn param<S: Into<String>>(mut self, name: S, ty: DeclaredType) -> Self {
        self.params.push(DeclaredParam::new(name, ty));
        self
    }

    pub fn returns(mut self, ty: DeclaredType) -> Self {
        self.returns = ty;
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn command(mut self, description: &str) -> Self {
        self.is_command = true;
        self.description = String::from(description);
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = String::from(description);
        self
    }
}

pub struct RegisteredMethod {
    pub descriptor: Arc<CallMethodDescriptor>,
    procedure: Arc<dyn Procedure>,
}

/// Server-side catalog of callable procedures.
pub struct MethodRegistry {
    by_id: HashMap<u32, RegisteredMethod>,
    by_name: HashMap<(String, String), u32>,
    next_id: u32,
}

impl MethodRegistry {
    pub fn new() -> MethodRegistry {
        MethodRegistry {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            next_id: 1,
        }
    }

    /// Build a registry from discovered candidates, failing on the first
    /// one whose signature cannot be published.
    pub fn from_candidates<I>(candidates: I) -> Result<MethodRegistry, String>
    where
        I: IntoIterator<Item = MethodCandidate>,
    {
        let mut registry = MethodRegistry::new();
        for candidate in candidates {
            registry.register(candidate)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, candidate: MethodCandidate) -> Result<u32, String> {
        let qualified = format!("{}.{}", candidate.class_name, candidate.method_name);
        validate_identifier(&candidate.class_name).map_err(|f| f.message)?;
        validate_identifier(&candidate.method_name).map_err(|f| f.message)?;

        let key = (candidate.class_name.clone(), candidate.method_name.clone());
        if self.by_name.contains_key(&key) {
            return Err(format!("{} is already registered", qualified));
        }

        let skip = candidate
            .params
            .iter()
            .take(2)
            .take_while(|p| p.ty == DeclaredType::CallerContext)
            .count();
        let mut inputs = Vec::with_capacity(candidate.params.len() - skip);
        for param in &candidate.params[skip..] {
            let kind = parameter_kind(&param.ty)
                .map_err(|e| format!("{}: parameter {}: {}", qualified, param.name, e))?;
            inputs.push(ParameterDescriptor {
                name: param.name.clone(),
                kind,
            });
        }

        let output = match &candidate.returns {
            DeclaredType::Void => None,
            ty => Some(ParameterDescriptor {
                name: String::from("return"),
                kind: parameter_kind(ty)
                    .map_err(|e| format!("{}: return type: {}", qualified, e))?,
            }),
        };

        let id = self.next_id;
        self.next_id += 1;
        let descriptor = CallMethodDescriptor {
            id,
            class_name: candidate.class_name,
            method_name: candidate.method_name,
            inputs,
            output,
            role: candidate.role,
            is_command: candidate.is_command,
            description: candidate.description,
        };

        self.by_name.insert(key, id);
        self.by_id.insert(
            id,
            RegisteredMethod {
                descriptor: Arc::new(descriptor),
                procedure: candidate.procedure,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Option<&RegisteredMethod> {
        self.by_id.get(&id)
    }

    pub fn descriptor(&self, class_name: &str, method_name: &str) -> Option<Arc<CallMethodDescriptor>> {
        self.by_name
            .get(&(class_name.to_string(), method_name.to_string()))
            .and_then(|id| self.by_id.get(id))
            .map(|m| Arc::clone(&m.descriptor))
    }

    /// Descriptors grouped by class name, in id order within a class.
    pub fn catalog(&self, commands_only: bool) -> BTreeMap<String, Vec<CallMethodDescriptor>> {
        let mut ids: Vec<&u32> = self.by_id.keys().collect();
        ids.sort();

        let mut catalog: BTreeMap<String, Vec<CallMethodDescriptor>> = BTreeMap::new();
        for id in ids {
            let d = &self.by_id[id].descriptor;
            if commands_only && !d.is_command {
                continue;
            }
            catalog
                .entry(d.class_name.clone())
                .or_default()
                .push(CallMethodDescriptor::clone(d));
        }
        catalog
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisteredMethod {
    /// Check the caller, decode the arguments, run the procedure and
    /// marshal its result.
    pub async fn invoke(&self, ctx: CallContext, wire_args: &[Value]) -> Result<Option<Value>, Fault> {
        let d = &self.descriptor;
        if ctx.role < d.role {
            return Err(Fault::unauthorized(format!(
                "{}.{} requires role {:?}, caller has {:?}",
                d.class_name, d.method_name, d.role, ctx.role
            )));
        }
        let args = d.decode_args(wire_args).map_err(Fault::validation)?;

        let procedure = Arc::clone(&self.procedure);
        let mut task = AbortOnDrop(tokio::spawn(async move { procedure.invoke(ctx, args).await }));
        let value = match (&mut task.0).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                return Err(Fault::backend(format!(
                    "{}.{} failed: {}",
                    d.class_name, d.method_name, e
                )))
            }
            Err(join_error) => {
                return Err(Fault::backend(format!(
                    "{}.{} panicked: {}",
                    d.class_name,
                    d.method_name,
                    panic_message(join_error)
                )))
            }
        };

        match &d.output {
            None => Ok(None),
            Some(output) => output
                .encode(&value)
                .map(Some)
                .map_err(|e| Fault::backend(format!("invalid return value: {}", e))),
        }
    }
}

/// Aborts the procedure task when an abandoned call drops its future.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(error: tokio::task::JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        String::from(*s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic payload")
    }
}

fn parameter_kind(ty: &DeclaredType) -> Result<ParameterKind, String> {
    match ty {
        DeclaredType::Primitive(p) => Ok(ParameterKind::Primitive { ty: *p }),
        DeclaredType::Structure { type_name, fields } => {
            if fields.is_empty() {
                return Err(format!("structure {} has no fields", type_name));
            }
            let mut out = Vec::with_capacity(fields.len());
            for (name, field_ty) in fields {
                match field_ty {
                    DeclaredType::Primitive(p) => out.push(FieldDescriptor {
                        name: name.clone(),
                        ty: *p,
                    }),
                    other => {
                        return Err(format!(
                            "field {}.{} has unsupported type {}",
                            type_name,
                            name,
                            describe(other)
                        ))
                    }
                }
            }
            Ok(ParameterKind::Structure {
                type_name: type_name.clone(),
                fields: out,
            })
        }
        other => Err(format!("unsupported type {}", describe(other))),
    }
}

fn describe(ty: &DeclaredType) -> String {
    match ty {
        DeclaredType::Void => String::from("void"),
        DeclaredType::Primitive(p) => format!("{:?}", p),
        DeclaredType::Structure { type_name, .. } => format!("structure {}", type_name),
        DeclaredType::CallerContext => String::from("caller context"),
        DeclaredType::ByRef(inner) => format!("by-reference {}", describe(inner)),
        DeclaredType::Out(inner) => format!("out {}", describe(inner)),
        DeclaredType::Unsupported(name) => name.clone(),
    }
}
