//! Typed entities over raw backend objects.
//!
//! Each entity class declares an ordered list of [`Field`]s and may extend a parent class.
//! Field lookup walks up the class tree, and a subclass inherits the preprocessing hook,
//! the validation hook, and the unique key of its nearest ancestor that defines one.
//!
//! An [`Entity`] holds native [`Value`]s.
//! Values are converted to the wire representation when the entity is saved and back when it is loaded.
//! Enumeration values travel as opaque identifiers resolved through an [`EnumCache`].
//! References to other entities travel as VIDs and come back as [`ObjectRef`]s.

pub mod model;

use crate::backend::{EnumEntry, Gateway, ObjectRecord, Reply, Request, ServiceKind};
use crate::error::ValidationFailure;
use crate::{vid, KBError, Result};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value as SqlValue;

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;

use tracing::debug;


//-----------------------------------------------------------------------------

/// Type of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Vid,
    String,
    Int,
    Long,
    Float,
    Boolean,
    Timestamp,
    /// Reference to an entity of the named class or its subclasses.
    Entity(&'static str),
    /// Reference to an entity of the class declaring the field.
    SelfRef,
    /// Value of the named enumeration.
    Enum(&'static str),
}

/// Is the field required?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
}

/// A field declaration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub ftype: FieldType,
    pub presence: Presence,
}

impl Field {
    /// Declares a required field.
    pub const fn required(name: &'static str, ftype: FieldType) -> Self {
        Field { name, ftype, presence: Presence::Required }
    }

    /// Declares an optional field.
    pub const fn optional(name: &'static str, ftype: FieldType) -> Self {
        Field { name, ftype, presence: Presence::Optional }
    }

    /// Returns `true` if the field is required.
    pub fn is_required(&self) -> bool {
        self.presence == Presence::Required
    }
}

/// Configuration of an entity: field values by name.
pub type Conf = BTreeMap<String, Value>;

/// Hook that fills in derived values before validation.
pub type PreprocessHook = fn(&mut Conf);

/// Hook that turns a raw backend report into a domain error.
pub type ValidationHook = fn(&'static EntityClass, &ValidationFailure) -> KBError;

/// An entity class.
pub struct EntityClass {
    pub name: &'static str,
    pub parent: Option<&'static EntityClass>,
    pub fields: &'static [Field],
    /// Fields whose values form the unique key; empty if the class does not define one.
    pub unique_key: &'static [&'static str],
    pub preprocess: Option<PreprocessHook>,
    pub validation: Option<ValidationHook>,
}

impl EntityClass {
    /// Returns the field with the given name and the class declaring it.
    pub fn field(&'static self, name: &str) -> Option<(&'static Field, &'static EntityClass)> {
        let mut class = Some(self);
        while let Some(current) = class {
            if let Some(field) = current.fields.iter().find(|x| x.name == name) {
                return Some((field, current));
            }
            class = current.parent;
        }
        None
    }

    /// Returns all fields, ancestors first.
    pub fn all_fields(&'static self) -> Vec<&'static Field> {
        let mut result: Vec<&'static Field> = Vec::new();
        for class in self.lineage().iter().rev() {
            result.extend(class.fields.iter());
        }
        result
    }

    /// Returns the class and its ancestors, most derived first.
    pub fn lineage(&'static self) -> Vec<&'static EntityClass> {
        let mut result = Vec::new();
        let mut class = Some(self);
        while let Some(current) = class {
            result.push(current);
            class = current.parent;
        }
        result
    }

    /// Returns `true` if the class is `other` or one of its subclasses.
    pub fn is_a(&'static self, other: &str) -> bool {
        self.lineage().iter().any(|x| x.name == other)
    }

    /// Returns the unique key fields and the class declaring them.
    pub fn unique_key(&'static self) -> Option<(&'static [&'static str], &'static EntityClass)> {
        self.lineage().into_iter().find(|x| !x.unique_key.is_empty()).map(|x| (x.unique_key, x))
    }

    fn preprocess_hook(&'static self) -> Option<PreprocessHook> {
        self.lineage().into_iter().find_map(|x| x.preprocess)
    }

    /// Translates a backend validation report with the nearest validation hook.
    pub fn handle_validation_errors(&'static self, failure: &ValidationFailure) -> KBError {
        match self.lineage().into_iter().find_map(|x| x.validation) {
            Some(hook) => hook(self, failure),
            None => default_validation_error(self, failure),
        }
    }
}

impl std::fmt::Debug for EntityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EntityClass")
            .field("name", &self.name)
            .field("parent", &self.parent.map(|x| x.name))
            .field("fields", &self.fields)
            .field("unique_key", &self.unique_key)
            .finish()
    }
}

// Class names are unique.
impl PartialEq for EntityClass {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for EntityClass {}

impl Display for EntityClass {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Builds the generic error for a backend validation report.
pub fn default_validation_error(class: &'static EntityClass, failure: &ValidationFailure) -> KBError {
    if !failure.missing.is_empty() {
        return KBError::Validation(format!("{}: missing required field(s) {}", class.name, failure.missing.join(", ")));
    }
    if let Some(key) = failure.duplicate_key.as_ref() {
        let readable: Vec<&str> = key.split(vid::KEY_SEPARATOR).collect();
        return KBError::Validation(format!("{}: duplicate unique key ({})", class.name, readable.join(", ")));
    }
    KBError::Validation(format!("{}: rejected by the backend", class.name))
}

//-----------------------------------------------------------------------------

/// Reference to a stored entity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    /// The declared class of the reference.
    pub class: String,
    pub vid: String,
}

/// A native field value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Vid(String),
    String(String),
    Int(i32),
    Long(i64),
    Float(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Entity(ObjectRef),
    Enum(String),
}

impl Value {
    /// Returns a reference value pointing to the entity.
    pub fn reference(entity: &Entity) -> Self {
        Value::Entity(entity.as_ref())
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Vid(_) => "VID",
            Value::String(_) => "string",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Boolean(_) => "boolean",
            Value::Timestamp(_) => "timestamp",
            Value::Entity(_) => "entity",
            Value::Enum(_) => "enum",
        }
    }

    // Checks that the value fits the field declared in `owner`.
    fn check(&self, field: &Field, owner: &'static EntityClass) -> Result<()> {
        let ok = match (self, field.ftype) {
            (Value::Vid(value), FieldType::Vid) => vid::is_vid(value),
            (Value::String(_), FieldType::String) => true,
            (Value::Int(_), FieldType::Int) => true,
            (Value::Long(_), FieldType::Long) => true,
            (Value::Float(_), FieldType::Float) => true,
            (Value::Boolean(_), FieldType::Boolean) => true,
            (Value::Timestamp(_), FieldType::Timestamp) => true,
            (Value::Entity(target), FieldType::Entity(class)) => Self::refers_to(target, class),
            (Value::Entity(target), FieldType::SelfRef) => Self::refers_to(target, owner.name),
            (Value::Enum(_), FieldType::Enum(_)) => true,
            _ => false,
        };
        if !ok {
            return Err(KBError::Validation(format!(
                "{}: field {} ({:?}) cannot hold a {} value {:?}",
                owner.name, field.name, field.ftype, self.type_name(), self
            )));
        }
        Ok(())
    }

    fn refers_to(target: &ObjectRef, class: &str) -> bool {
        match model::class_by_name(&target.class) {
            Some(target_class) => target_class.is_a(class),
            None => false,
        }
    }

    /// Converts the value to the wire representation.
    pub fn wrap(&self, enums: &EnumCache, ftype: FieldType) -> Result<SqlValue> {
        match (self, ftype) {
            (Value::Vid(value), _) | (Value::String(value), _) => Ok(SqlValue::Text(value.clone())),
            (Value::Int(value), _) => Ok(SqlValue::Integer(*value as i64)),
            (Value::Long(value), _) => Ok(SqlValue::Integer(*value)),
            (Value::Float(value), _) => Ok(SqlValue::Real(*value)),
            (Value::Boolean(value), _) => Ok(SqlValue::Integer(*value as i64)),
            (Value::Timestamp(value), _) => Ok(SqlValue::Integer(value.timestamp_millis())),
            (Value::Entity(target), _) => Ok(SqlValue::Text(target.vid.clone())),
            (Value::Enum(name), FieldType::Enum(class)) => enums.id(class, name).map(SqlValue::Integer),
            (Value::Enum(name), _) => Err(KBError::Invariant(format!("enum value {} in a non-enum field", name))),
        }
    }

    /// Converts a wire value of a field declared in `owner` to a native value.
    pub fn unwrap(value: &SqlValue, field: &Field, owner: &'static EntityClass, enums: &EnumCache) -> Result<Self> {
        let result = match (field.ftype, value) {
            (FieldType::Vid, SqlValue::Text(text)) => Value::Vid(text.clone()),
            (FieldType::String, SqlValue::Text(text)) => Value::String(text.clone()),
            (FieldType::Int, SqlValue::Integer(number)) => {
                let number = i32::try_from(*number).map_err(|_| KBError::Invariant(
                    format!("{}: value {} of field {} does not fit an int", owner.name, number, field.name)
                ))?;
                Value::Int(number)
            },
            (FieldType::Long, SqlValue::Integer(number)) => Value::Long(*number),
            (FieldType::Float, SqlValue::Real(number)) => Value::Float(*number),
            (FieldType::Float, SqlValue::Integer(number)) => Value::Float(*number as f64),
            (FieldType::Boolean, SqlValue::Integer(number)) => Value::Boolean(*number != 0),
            (FieldType::Timestamp, SqlValue::Integer(millis)) => {
                let time = Utc.timestamp_millis_opt(*millis).single().ok_or_else(|| KBError::Invariant(
                    format!("{}: invalid timestamp {} in field {}", owner.name, millis, field.name)
                ))?;
                Value::Timestamp(time)
            },
            (FieldType::Entity(class), SqlValue::Text(target)) => {
                Value::Entity(ObjectRef { class: class.to_string(), vid: target.clone() })
            },
            (FieldType::SelfRef, SqlValue::Text(target)) => {
                Value::Entity(ObjectRef { class: owner.name.to_string(), vid: target.clone() })
            },
            (FieldType::Enum(class), SqlValue::Integer(id)) => Value::Enum(enums.name(class, *id)?),
            _ => {
                return Err(KBError::Invariant(format!(
                    "{}: wire value {:?} does not match field {} ({:?})", owner.name, value, field.name, field.ftype
                )));
            },
        };
        Ok(result)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

//-----------------------------------------------------------------------------

/// In-process cache of backend enumerations.
///
/// Maps `(enumeration, value name)` to the opaque identifier stored on the wire and back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnumCache {
    by_name: HashMap<(String, String), i64>,
    by_id: HashMap<i64, (String, String)>,
}

impl EnumCache {
    /// Builds the cache from backend entries.
    pub fn new(entries: &[EnumEntry]) -> Self {
        let mut result = EnumCache::default();
        for entry in entries.iter() {
            result.by_name.insert((entry.class.clone(), entry.value.clone()), entry.id);
            result.by_id.insert(entry.id, (entry.class.clone(), entry.value.clone()));
        }
        result
    }

    /// Loads all enumerations through the gateway.
    pub fn load(gateway: &Gateway) -> Result<Self> {
        let entries = gateway.perform(ServiceKind::Query, Request::GetEnums)?.into_enums()?;
        debug!("Loaded {} enumeration values", entries.len());
        Ok(Self::new(&entries))
    }

    /// Returns the identifier of the value.
    pub fn id(&self, class: &str, name: &str) -> Result<i64> {
        self.by_name.get(&(class.to_string(), name.to_string())).copied().ok_or_else(|| {
            KBError::NotFound(format!("{} is not a valid {} value", name, class))
        })
    }

    /// Returns the name of the value with the identifier.
    pub fn name(&self, class: &str, id: i64) -> Result<String> {
        match self.by_id.get(&id) {
            Some((owner, name)) if owner == class => Ok(name.clone()),
            _ => Err(KBError::NotFound(format!("enumeration {} has no value with id {}", class, id))),
        }
    }

    /// Returns the value names of an enumeration in identifier order.
    pub fn values(&self, class: &str) -> Vec<String> {
        let mut entries: Vec<(i64, &String)> = self.by_id.iter()
            .filter(|(_, (owner, _))| owner == class)
            .map(|(id, (_, name))| (*id, name))
            .collect();
        entries.sort();
        entries.into_iter().map(|(_, name)| name.clone()).collect()
    }

    /// Returns the number of cached values.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns `true` if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

//-----------------------------------------------------------------------------

/// A typed entity.
///
/// Entities are staged with [`Entity::create`] and persisted with [`Entity::save`].
#[derive(Clone, Debug, PartialEq)]
pub struct Entity {
    class: &'static EntityClass,
    values: Conf,
    persisted: bool,
}

impl Entity {
    /// Field holding the VID of every entity.
    pub const VID: &'static str = "vid";

    /// Stages a new entity.
    ///
    /// Assigns a VID if the configuration does not have one, applies the preprocessing hook of the class,
    /// checks the values against the field types, and fails if a required field is missing.
    pub fn create(class: &'static EntityClass, conf: Conf) -> Result<Self> {
        let mut conf = conf;
        conf.entry(Self::VID.to_string()).or_insert_with(|| Value::Vid(vid::make_vid()));
        if let Some(hook) = class.preprocess_hook() {
            hook(&mut conf);
        }

        for (name, value) in conf.iter() {
            let (field, owner) = class.field(name).ok_or_else(|| {
                KBError::Validation(format!("{}: unknown field {}", class.name, name))
            })?;
            value.check(field, owner)?;
        }
        let missing: Vec<&str> = class.all_fields().iter()
            .filter(|x| x.is_required() && !conf.contains_key(x.name))
            .map(|x| x.name)
            .collect();
        if !missing.is_empty() {
            return Err(KBError::Validation(format!(
                "{}: missing required field(s) {}", class.name, missing.join(", ")
            )));
        }

        Ok(Entity { class, values: conf, persisted: false })
    }

    /// Returns the class of the entity.
    pub fn class(&self) -> &'static EntityClass {
        self.class
    }

    /// Returns the VID of the entity.
    pub fn vid(&self) -> &str {
        match self.values.get(Self::VID) {
            Some(Value::Vid(value)) => value,
            _ => "",
        }
    }

    /// Returns a reference to the entity.
    pub fn as_ref(&self) -> ObjectRef {
        ObjectRef { class: self.class.name.to_string(), vid: self.vid().to_string() }
    }

    /// Returns `true` if the entity has been saved or loaded from the backend.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Returns the value of the field, or [`None`] if the field is not set.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Returns the value of a string field.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(Value::String(value)) | Some(Value::Vid(value)) | Some(Value::Enum(value)) => Some(value),
            _ => None,
        }
    }

    /// Returns the value of a reference field.
    pub fn get_ref(&self, name: &str) -> Option<&ObjectRef> {
        match self.values.get(name) {
            Some(Value::Entity(target)) => Some(target),
            _ => None,
        }
    }

    /// Returns the value of a float field.
    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.values.get(name) {
            Some(Value::Float(value)) => Some(*value),
            _ => None,
        }
    }

    /// Sets a field.
    ///
    /// Fails if the class has no such field or the value does not fit it.
    /// The VID of an entity cannot be changed.
    pub fn set<V: Into<Value>>(&mut self, name: &str, value: V) -> Result<()> {
        let value = value.into();
        let (field, owner) = self.class.field(name).ok_or_else(|| {
            KBError::Validation(format!("{}: unknown field {}", self.class.name, name))
        })?;
        if name == Self::VID {
            return Err(KBError::Validation(format!("{}: the VID cannot be changed", self.class.name)));
        }
        value.check(field, owner)?;
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    /// Clears an optional field.
    pub fn unset(&mut self, name: &str) -> Result<()> {
        let (field, _) = self.class.field(name).ok_or_else(|| {
            KBError::Validation(format!("{}: unknown field {}", self.class.name, name))
        })?;
        if field.is_required() {
            return Err(KBError::Validation(format!("{}: field {} is required", self.class.name, name)));
        }
        self.values.remove(name);
        Ok(())
    }

    fn unique_key(&self) -> Option<String> {
        let (fields, owner) = self.class.unique_key()?;
        let mut parts = vec![owner.name.to_string()];
        for name in fields.iter() {
            let part = match self.values.get(*name)? {
                Value::Vid(value) | Value::String(value) | Value::Enum(value) => value.clone(),
                Value::Entity(target) => target.vid.clone(),
                Value::Int(value) => value.to_string(),
                Value::Long(value) => value.to_string(),
                Value::Float(value) => value.to_string(),
                Value::Boolean(value) => value.to_string(),
                Value::Timestamp(value) => value.timestamp_millis().to_string(),
            };
            parts.push(part);
        }
        Some(vid::make_unique_key(&parts))
    }

    /// Converts the entity to a backend record.
    pub fn to_record(&self, enums: &EnumCache) -> Result<ObjectRecord> {
        let mut attributes = BTreeMap::new();
        for (name, value) in self.values.iter() {
            let (field, _) = self.class.field(name).ok_or_else(|| {
                KBError::Invariant(format!("{}: unknown field {}", self.class.name, name))
            })?;
            attributes.insert(name.clone(), value.wrap(enums, field.ftype)?);
        }
        Ok(ObjectRecord {
            vid: self.vid().to_string(),
            class: self.class.name.to_string(),
            lineage: self.class.lineage().iter().map(|x| x.name.to_string()).collect(),
            unique_key: self.unique_key(),
            required: self.class.all_fields().iter().filter(|x| x.is_required()).map(|x| x.name.to_string()).collect(),
            attributes,
        })
    }

    /// Builds an entity from a backend record.
    ///
    /// Attributes the class does not declare are ignored.
    pub fn from_record(record: &ObjectRecord, enums: &EnumCache) -> Result<Self> {
        let class = model::class_by_name(&record.class).ok_or_else(|| {
            KBError::NotFound(format!("unknown entity class {} for object {}", record.class, record.vid))
        })?;
        let mut values = Conf::new();
        for (name, value) in record.attributes.iter() {
            if let Some((field, owner)) = class.field(name) {
                values.insert(name.clone(), Value::unwrap(value, field, owner, enums)?);
            }
        }
        values.insert(Self::VID.to_string(), Value::Vid(record.vid.clone()));
        Ok(Entity { class, values, persisted: true })
    }

    /// Persists the entity.
    ///
    /// Backend validation failures are translated by the validation hook of the class.
    pub fn save(&mut self, gateway: &Gateway, enums: &EnumCache) -> Result<()> {
        let record = self.to_record(enums)?;
        match gateway.perform(ServiceKind::Update, Request::SaveObject(record)) {
            Ok(Reply::Saved(_)) => {
                self.persisted = true;
                Ok(())
            },
            Ok(reply) => Err(KBError::Invariant(format!("unexpected reply {:?} to a save", reply))),
            Err(KBError::BackendValidation(failure)) => Err(self.class.handle_validation_errors(&failure)),
            Err(err) => Err(err),
        }
    }

    /// Replaces the values of the entity with the stored ones.
    pub fn reload(&mut self, gateway: &Gateway, enums: &EnumCache) -> Result<()> {
        let record = gateway.perform(ServiceKind::Query, Request::GetObject { vid: self.vid().to_string() })?.into_object()?;
        let record = record.ok_or_else(|| {
            KBError::NotFound(format!("{} {} is not stored", self.class.name, self.vid()))
        })?;
        *self = Self::from_record(&record, enums)?;
        Ok(())
    }
}

//-----------------------------------------------------------------------------
