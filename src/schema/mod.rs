//! Schema registry: services, methods and message layouts shared by both peers.
//!
//! There is no runtime schema exchange. Client and server must load the same
//! schema text (or compatible revisions of it) before any call is attempted.
//! Field numbers form the wire contract: within a message they are unique, and
//! across revisions a number keeps its name and type forever. Numbers dropped
//! by a revision become reserved so they can never be handed out again.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};

mod parser;

/// Type of a message field.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float,
    Double,
    String,
    Bytes,
    /// A nested message, by name
    Message(String),
    /// Zero or more values of the inner type. The inner type is never repeated itself.
    Repeated(Box<FieldType>),
}

impl FieldType {
    /// Maps a schema-text scalar name to its type.
    pub fn scalar(name: &str) -> Option<FieldType> {
        let ty = match name {
            "bool" => FieldType::Bool,
            "int32" => FieldType::Int32,
            "int64" => FieldType::Int64,
            "uint32" => FieldType::UInt32,
            "uint64" => FieldType::UInt64,
            "float" => FieldType::Float,
            "double" => FieldType::Double,
            "string" => FieldType::String,
            "bytes" => FieldType::Bytes,
            _ => return None,
        };
        Some(ty)
    }

    pub fn repeated(inner: FieldType) -> FieldType {
        FieldType::Repeated(Box::new(inner))
    }

    pub fn message(name: impl Into<String>) -> FieldType {
        FieldType::Message(name.into())
    }

    fn referenced_message(&self) -> Option<&str> {
        match self {
            FieldType::Message(name) => Some(name),
            FieldType::Repeated(inner) => inner.referenced_message(),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Bool => f.write_str("bool"),
            FieldType::Int32 => f.write_str("int32"),
            FieldType::Int64 => f.write_str("int64"),
            FieldType::UInt32 => f.write_str("uint32"),
            FieldType::UInt64 => f.write_str("uint64"),
            FieldType::Float => f.write_str("float"),
            FieldType::Double => f.write_str("double"),
            FieldType::String => f.write_str("string"),
            FieldType::Bytes => f.write_str("bytes"),
            FieldType::Message(name) => f.write_str(name),
            FieldType::Repeated(inner) => write!(f, "repeated {inner}"),
        }
    }
}

/// One `(number, name, type)` entry of a message layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub number: u32,
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDescriptor {
    pub fn new(number: u32, name: impl Into<String>, field_type: FieldType) -> Self {
        Self { number, name: name.into(), field_type }
    }
}

/// Layout of a message type.
#[derive(Clone, Debug)]
pub struct MessageSchema {
    name: String,
    fields: Vec<FieldDescriptor>,
    reserved: BTreeSet<u32>,
    by_number: HashMap<u32, usize>,
    by_name: HashMap<String, usize>,
}

impl PartialEq for MessageSchema {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.fields == other.fields && self.reserved == other.reserved
    }
}

impl MessageSchema {
    /// Builds a message layout, checking that field numbers and names are unique.
    pub fn new(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Result<Self> {
        Self::with_reserved(name, fields, [])
    }

    /// Builds a message layout whose `reserved` numbers may not be used by any field.
    pub fn with_reserved(
        name: impl Into<String>,
        fields: Vec<FieldDescriptor>,
        reserved: impl IntoIterator<Item = u32>,
    ) -> Result<Self> {
        let name = name.into();
        let reserved: BTreeSet<u32> = reserved.into_iter().collect();
        let mut by_number = HashMap::with_capacity(fields.len());
        let mut by_name = HashMap::with_capacity(fields.len());

        for (index, field) in fields.iter().enumerate() {
            if field.number == 0 {
                return Err(Error::SchemaConflict(format!(
                    "{name}.{}: field number 0 is not allowed",
                    field.name
                )));
            }
            if let FieldType::Repeated(inner) = &field.field_type {
                if matches!(**inner, FieldType::Repeated(_)) {
                    return Err(Error::SchemaConflict(format!(
                        "{name}.{}: nested repeated fields are not supported",
                        field.name
                    )));
                }
            }
            if reserved.contains(&field.number) {
                return Err(Error::SchemaConflict(format!(
                    "{name}.{}: field number {} is reserved",
                    field.name, field.number
                )));
            }
            if by_number.insert(field.number, index).is_some() {
                return Err(Error::SchemaConflict(format!(
                    "{name}: field number {} used twice",
                    field.number
                )));
            }
            if by_name.insert(field.name.clone(), index).is_some() {
                return Err(Error::SchemaConflict(format!(
                    "{name}: field name {} used twice",
                    field.name
                )));
            }
        }

        Ok(Self { name, fields, reserved, by_number, by_name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn reserved(&self) -> &BTreeSet<u32> {
        &self.reserved
    }

    pub fn field_by_number(&self, number: u32) -> Option<&FieldDescriptor> {
        self.by_number.get(&number).map(|&i| &self.fields[i])
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDescriptor> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    /// Checks that `revision` may replace `self` and returns the stored form
    /// of the revision: fields dropped by it are added to its reserved set.
    fn revise(&self, revision: MessageSchema) -> Result<MessageSchema> {
        let conflict = |what: String| Error::SchemaConflict(format!("{}: {what}", self.name));

        for field in &revision.fields {
            if self.reserved.contains(&field.number) {
                return Err(conflict(format!(
                    "field {} reuses retired number {}",
                    field.name, field.number
                )));
            }
            if let Some(old) = self.field_by_number(field.number) {
                if old.name != field.name || old.field_type != field.field_type {
                    return Err(conflict(format!(
                        "field number {} was `{} {}`, redefined as `{} {}`",
                        field.number, old.field_type, old.name, field.field_type, field.name
                    )));
                }
            }
            if let Some(old) = self.field_by_name(&field.name) {
                if old.number != field.number {
                    return Err(conflict(format!(
                        "field {} moved from number {} to {}",
                        field.name, old.number, field.number
                    )));
                }
            }
        }

        let mut reserved = revision.reserved.clone();
        reserved.extend(self.reserved.iter().copied());
        for old in &self.fields {
            if revision.field_by_number(old.number).is_none() {
                reserved.insert(old.number);
            }
        }
        MessageSchema::with_reserved(revision.name, revision.fields, reserved)
    }
}

/// A method of a service: request and response message type names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDefinition {
    pub name: String,
    pub request_type: String,
    pub response_type: String,
}

impl MethodDefinition {
    pub fn new(
        name: impl Into<String>,
        request_type: impl Into<String>,
        response_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            request_type: request_type.into(),
            response_type: response_type.into(),
        }
    }
}

/// A named service and its ordered list of methods.
#[derive(Clone, Debug)]
pub struct ServiceDefinition {
    name: String,
    methods: Vec<MethodDefinition>,
    by_name: HashMap<String, usize>,
}

impl PartialEq for ServiceDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.methods == other.methods
    }
}

impl ServiceDefinition {
    /// Builds a service, checking that method names are unique.
    pub fn new(name: impl Into<String>, methods: Vec<MethodDefinition>) -> Result<Self> {
        let name = name.into();
        let mut by_name = HashMap::with_capacity(methods.len());
        for (index, method) in methods.iter().enumerate() {
            if by_name.insert(method.name.clone(), index).is_some() {
                return Err(Error::SchemaConflict(format!(
                    "{name}: method {} defined twice",
                    method.name
                )));
            }
        }
        Ok(Self { name, methods, by_name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[MethodDefinition] {
        &self.methods
    }

    pub fn method(&self, name: &str) -> Option<&MethodDefinition> {
        self.by_name.get(name).map(|&i| &self.methods[i])
    }

    fn check_revision(&self, revision: &ServiceDefinition) -> Result<()> {
        for method in &revision.methods {
            if let Some(old) = self.method(&method.name) {
                if old != method {
                    return Err(Error::SchemaConflict(format!(
                        "{}: method {} was ({}) -> ({}), redefined as ({}) -> ({})",
                        self.name,
                        method.name,
                        old.request_type,
                        old.response_type,
                        method.request_type,
                        method.response_type
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Holds every known message and service definition.
///
/// Build it once at startup, wrap it in an [`Arc`] and hand clones to the
/// codec, the handler set and the clients.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    messages: HashMap<String, Arc<MessageSchema>>,
    services: HashMap<String, Arc<ServiceDefinition>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses schema text into a fresh registry.
    pub fn from_source(source: &str) -> Result<Self> {
        let mut registry = Self::new();
        registry.load(source)?;
        Ok(registry)
    }

    /// Parses schema text and defines everything it declares.
    ///
    /// Messages are defined before services, so the order of declarations in
    /// the text does not matter. After loading, every message type referenced
    /// by a field must be defined.
    ///
    /// Either every definition in the text is applied or none is.
    pub fn load(&mut self, source: &str) -> Result<()> {
        let document = parser::parse(source)?;
        let mut staged = self.clone();
        for message in document.messages {
            staged.define_message(message)?;
        }
        staged.check_message_references()?;
        for service in document.services {
            staged.define_service(service)?;
        }
        *self = staged;
        Ok(())
    }

    /// Registers a message layout.
    ///
    /// Redefining a message with the same layout is a no-op; a compatible
    /// revision replaces the stored layout; anything else is a conflict.
    pub fn define_message(&mut self, schema: MessageSchema) -> Result<Arc<MessageSchema>> {
        let stored = match self.messages.get(schema.name()) {
            Some(existing) if **existing == schema => return Ok(existing.clone()),
            Some(existing) => {
                let revised = existing.revise(schema)?;
                debug!("Revised message {} ({} fields)", revised.name(), revised.fields().len());
                Arc::new(revised)
            }
            None => {
                debug!("Defined message {} ({} fields)", schema.name(), schema.fields().len());
                Arc::new(schema)
            }
        };
        self.messages.insert(stored.name().to_string(), stored.clone());
        Ok(stored)
    }

    /// Registers a service. Its request and response types must already be defined.
    pub fn define_service(&mut self, service: ServiceDefinition) -> Result<Arc<ServiceDefinition>> {
        for method in service.methods() {
            for ty in [&method.request_type, &method.response_type] {
                if !self.messages.contains_key(ty) {
                    return Err(Error::UnknownType(ty.clone()));
                }
            }
        }

        if let Some(existing) = self.services.get(service.name()) {
            if **existing == service {
                return Ok(existing.clone());
            }
            existing.check_revision(&service)?;
            // A revision may add methods but never drops existing ones.
            let mut methods = service.methods.clone();
            for old in existing.methods() {
                if service.method(&old.name).is_none() {
                    methods.push(old.clone());
                }
            }
            let merged = Arc::new(ServiceDefinition::new(service.name, methods)?);
            self.services.insert(merged.name().to_string(), merged.clone());
            return Ok(merged);
        }

        debug!("Defined service {} ({} methods)", service.name(), service.methods().len());
        let stored = Arc::new(service);
        self.services.insert(stored.name().to_string(), stored.clone());
        Ok(stored)
    }

    pub fn message(&self, name: &str) -> Option<&Arc<MessageSchema>> {
        self.messages.get(name)
    }

    pub fn service(&self, name: &str) -> Option<&Arc<ServiceDefinition>> {
        self.services.get(name)
    }

    pub fn method(&self, service: &str, method: &str) -> Option<&MethodDefinition> {
        self.services.get(service).and_then(|s| s.method(method))
    }

    /// Resolves a method and both of its message layouts.
    pub fn resolve_method(
        &self,
        service: &str,
        method: &str,
    ) -> Result<(MethodDefinition, Arc<MessageSchema>, Arc<MessageSchema>)> {
        let definition = self.method(service, method).ok_or_else(|| Error::UnknownMethod {
            service: service.to_string(),
            method: method.to_string(),
        })?;
        let request = self
            .message(&definition.request_type)
            .ok_or_else(|| Error::UnknownType(definition.request_type.clone()))?;
        let response = self
            .message(&definition.response_type)
            .ok_or_else(|| Error::UnknownType(definition.response_type.clone()))?;
        Ok((definition.clone(), request.clone(), response.clone()))
    }

    pub fn services(&self) -> impl Iterator<Item = &Arc<ServiceDefinition>> {
        self.services.values()
    }

    fn check_message_references(&self) -> Result<()> {
        for schema in self.messages.values() {
            for field in schema.fields() {
                if let Some(name) = field.field_type.referenced_message() {
                    if !self.messages.contains_key(name) {
                        return Err(Error::UnknownType(name.to_string()));
                    }
                }
            }
        }
        Ok(())
    }
}
