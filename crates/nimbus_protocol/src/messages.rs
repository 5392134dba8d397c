//! Record deltas, server messages, and request bodies.

use crate::error::{ProtocolError, ProtocolResult};
use crate::fields::Fields;
use nimbus_codec::{EncodedValue, WireValue};

/// One named property value.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    /// Property name.
    pub name: String,
    /// Tagged value.
    pub value: EncodedValue,
}

impl Property {
    /// Creates a property.
    pub fn new(name: impl Into<String>, value: EncodedValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    fn to_wire(&self) -> WireValue {
        WireValue::Array(vec![WireValue::from(self.name.as_str()), self.value.to_wire()])
    }

    fn from_wire(value: &WireValue) -> ProtocolResult<Self> {
        match value.as_array() {
            Some([WireValue::Text(name), encoded]) => {
                Ok(Self::new(name.clone(), EncodedValue::from_wire(encoded)?))
            }
            _ => Err(ProtocolError::InvalidField {
                context: "Property",
                field: "property",
                expected: "[name, [tag, bytes]]",
            }),
        }
    }
}

fn properties_to_wire(properties: &[Property]) -> WireValue {
    WireValue::Array(properties.iter().map(Property::to_wire).collect())
}

fn properties_from_wire(items: &[WireValue]) -> ProtocolResult<Vec<Property>> {
    items.iter().map(Property::from_wire).collect()
}

/// A change advancing one record by one version, or a full snapshot.
///
/// With `deleted` set, the remaining change fields are ignored.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeltaData {
    /// Service-scoped class id of the record.
    pub class_id: u32,
    /// Record primary key.
    pub primary_key: String,
    /// Version this delta produces.
    pub version: u64,
    /// Properties set by this version.
    pub changed_properties: Vec<Property>,
    /// Properties removed by this version.
    pub deleted_property_names: Vec<String>,
    /// The record no longer exists.
    pub deleted: bool,
}

impl DeltaData {
    /// A delta that sets `changed_properties` at `version`.
    pub fn update(
        class_id: u32,
        primary_key: impl Into<String>,
        version: u64,
        changed_properties: Vec<Property>,
    ) -> Self {
        Self {
            class_id,
            primary_key: primary_key.into(),
            version,
            changed_properties,
            ..Self::default()
        }
    }

    /// A deletion marker.
    pub fn deletion(class_id: u32, primary_key: impl Into<String>, version: u64) -> Self {
        Self {
            class_id,
            primary_key: primary_key.into(),
            version,
            deleted: true,
            ..Self::default()
        }
    }

    /// Converts to a wire map.
    pub fn to_wire(&self) -> WireValue {
        let mut fields = vec![
            ("class_id", WireValue::from(self.class_id)),
            ("primary_key", WireValue::from(self.primary_key.as_str())),
            ("version", version_to_wire(self.version)),
        ];
        if self.deleted {
            fields.push(("deleted", WireValue::Bool(true)));
        } else {
            fields.push((
                "changed_properties",
                properties_to_wire(&self.changed_properties),
            ));
            if !self.deleted_property_names.is_empty() {
                fields.push((
                    "deleted_property_names",
                    WireValue::Array(
                        self.deleted_property_names
                            .iter()
                            .map(|n| WireValue::from(n.as_str()))
                            .collect(),
                    ),
                ));
            }
        }
        WireValue::fields(fields)
    }

    /// Parses a wire map.
    pub fn from_wire(value: &WireValue) -> ProtocolResult<Self> {
        let f = Fields::of(value, "DeltaData")?;
        Ok(Self {
            class_id: f.u32("class_id")?,
            primary_key: f.text("primary_key")?,
            version: f.unsigned("version")?,
            changed_properties: properties_from_wire(f.list("changed_properties")?)?,
            deleted_property_names: f.text_list("deleted_property_names")?,
            deleted: f.bool_or("deleted", false)?,
        })
    }
}

#[allow(clippy::cast_possible_wrap)]
fn version_to_wire(version: u64) -> WireValue {
    WireValue::Integer(version as i64)
}

pub(crate) fn deltas_to_wire(deltas: &[DeltaData]) -> WireValue {
    WireValue::Array(deltas.iter().map(DeltaData::to_wire).collect())
}

pub(crate) fn deltas_from_wire(items: &[WireValue]) -> ProtocolResult<Vec<DeltaData>> {
    items.iter().map(DeltaData::from_wire).collect()
}

/// A batch of record changes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataUpdateMessage {
    /// Deltas in server order.
    pub deltas: Vec<DeltaData>,
}

/// An event raised by a record or callable.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    /// Event class id.
    pub class_id: u32,
    /// Record or callable reference to the event source.
    pub source: EncodedValue,
    /// Event payload properties.
    pub properties: Vec<Property>,
    /// Record changes the event depends on.
    pub deltas: Vec<DeltaData>,
}

/// A message produced by the server, either pushed or bundled in a response.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Record changes.
    DataUpdate(DataUpdateMessage),
    /// Event notification.
    Event(EventMessage),
}

impl ServerMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            ServerMessage::DataUpdate(_) => 1,
            ServerMessage::Event(_) => 2,
        }
    }

    /// Converts to a wire map.
    pub fn to_wire(&self) -> WireValue {
        let kind = ("kind", WireValue::from(self.type_code()));
        match self {
            ServerMessage::DataUpdate(msg) => {
                WireValue::fields([kind, ("deltas", deltas_to_wire(&msg.deltas))])
            }
            ServerMessage::Event(msg) => WireValue::fields([
                kind,
                ("class_id", WireValue::from(msg.class_id)),
                ("source", msg.source.to_wire()),
                ("properties", properties_to_wire(&msg.properties)),
                ("deltas", deltas_to_wire(&msg.deltas)),
            ]),
        }
    }

    /// Parses a wire map.
    pub fn from_wire(value: &WireValue) -> ProtocolResult<Self> {
        let f = Fields::of(value, "ServerMessage")?;
        match f.unsigned("kind")? {
            1 => Ok(ServerMessage::DataUpdate(DataUpdateMessage {
                deltas: deltas_from_wire(f.list("deltas")?)?,
            })),
            2 => Ok(ServerMessage::Event(EventMessage {
                class_id: f.u32("class_id")?,
                source: f.encoded("source")?,
                properties: properties_from_wire(f.list("properties")?)?,
                deltas: deltas_from_wire(f.list("deltas")?)?,
            })),
            other => Err(ProtocolError::UnknownMessageKind(other)),
        }
    }
}

/// Names one record on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordTarget {
    /// Class id.
    pub class_id: u32,
    /// Primary key.
    pub primary_key: String,
}

impl RecordTarget {
    /// Creates a target.
    pub fn new(class_id: u32, primary_key: impl Into<String>) -> Self {
        Self {
            class_id,
            primary_key: primary_key.into(),
        }
    }

    fn to_wire(&self) -> WireValue {
        WireValue::fields([
            ("class_id", WireValue::from(self.class_id)),
            ("primary_key", WireValue::from(self.primary_key.as_str())),
        ])
    }

    fn from_wire(value: &WireValue) -> ProtocolResult<Self> {
        let f = Fields::of(value, "RecordTarget")?;
        Ok(Self::new(f.u32("class_id")?, f.text("primary_key")?))
    }
}

/// Names one event stream on the server.
#[derive(Debug, Clone, PartialEq)]
pub struct EventChannelTarget {
    /// Event class id.
    pub class_id: u32,
    /// Record or callable reference to the source.
    pub source: EncodedValue,
}

impl EventChannelTarget {
    fn to_wire(&self) -> WireValue {
        WireValue::fields([
            ("class_id", WireValue::from(self.class_id)),
            ("source", self.source.to_wire()),
        ])
    }

    fn from_wire(value: &WireValue) -> ProtocolResult<Self> {
        let f = Fields::of(value, "EventChannelTarget")?;
        Ok(Self {
            class_id: f.u32("class_id")?,
            source: f.encoded("source")?,
        })
    }
}

/// Invoke a method on a remote object.
#[derive(Debug, Clone, PartialEq)]
pub struct CallMethodRequest {
    /// Reference to the target object.
    pub target: EncodedValue,
    /// Method id within the target's class.
    pub method_id: u32,
    /// Positional arguments.
    pub arguments: Vec<EncodedValue>,
    /// Full snapshots of every record the target or arguments reference.
    pub referenced_deltas: Vec<DeltaData>,
}

/// Persist records.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaveDataRequest {
    /// Full snapshots of the saved records and everything they reference.
    pub referenced_deltas: Vec<DeltaData>,
}

/// Request kind code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Fetch a record snapshot.
    GetData,
    /// Invoke a method.
    CallMethod,
    /// Persist records.
    SaveData,
    /// Start an event stream.
    SubscribeEvent,
    /// Stop an event stream.
    UnsubscribeEvent,
    /// Start record update pushes.
    SubscribeDataUpdates,
    /// Stop record update pushes.
    UnsubscribeDataUpdates,
}

impl RequestKind {
    /// Wire code.
    pub fn to_code(self) -> u8 {
        match self {
            RequestKind::GetData => 1,
            RequestKind::CallMethod => 2,
            RequestKind::SaveData => 3,
            RequestKind::SubscribeEvent => 4,
            RequestKind::UnsubscribeEvent => 5,
            RequestKind::SubscribeDataUpdates => 6,
            RequestKind::UnsubscribeDataUpdates => 7,
        }
    }

    /// Parses a wire code.
    pub fn from_code(code: u64) -> ProtocolResult<Self> {
        Ok(match code {
            1 => RequestKind::GetData,
            2 => RequestKind::CallMethod,
            3 => RequestKind::SaveData,
            4 => RequestKind::SubscribeEvent,
            5 => RequestKind::UnsubscribeEvent,
            6 => RequestKind::SubscribeDataUpdates,
            7 => RequestKind::UnsubscribeDataUpdates,
            other => return Err(ProtocolError::UnknownRequestKind(other)),
        })
    }
}

/// Typed request body; the kind follows from the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Fetch a record snapshot.
    GetData(RecordTarget),
    /// Invoke a method.
    CallMethod(CallMethodRequest),
    /// Persist records.
    SaveData(SaveDataRequest),
    /// Start an event stream.
    SubscribeEvent(EventChannelTarget),
    /// Stop an event stream.
    UnsubscribeEvent(EventChannelTarget),
    /// Start record update pushes.
    SubscribeDataUpdates(RecordTarget),
    /// Stop record update pushes.
    UnsubscribeDataUpdates(RecordTarget),
}

impl RequestBody {
    /// The request kind of this body.
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestBody::GetData(_) => RequestKind::GetData,
            RequestBody::CallMethod(_) => RequestKind::CallMethod,
            RequestBody::SaveData(_) => RequestKind::SaveData,
            RequestBody::SubscribeEvent(_) => RequestKind::SubscribeEvent,
            RequestBody::UnsubscribeEvent(_) => RequestKind::UnsubscribeEvent,
            RequestBody::SubscribeDataUpdates(_) => RequestKind::SubscribeDataUpdates,
            RequestBody::UnsubscribeDataUpdates(_) => RequestKind::UnsubscribeDataUpdates,
        }
    }

    pub(crate) fn to_wire(&self) -> WireValue {
        match self {
            RequestBody::GetData(t)
            | RequestBody::SubscribeDataUpdates(t)
            | RequestBody::UnsubscribeDataUpdates(t) => t.to_wire(),
            RequestBody::SubscribeEvent(t) | RequestBody::UnsubscribeEvent(t) => t.to_wire(),
            RequestBody::CallMethod(req) => WireValue::fields([
                ("target", req.target.to_wire()),
                ("method_id", WireValue::from(req.method_id)),
                (
                    "arguments",
                    WireValue::Array(req.arguments.iter().map(EncodedValue::to_wire).collect()),
                ),
                ("referenced_deltas", deltas_to_wire(&req.referenced_deltas)),
            ]),
            RequestBody::SaveData(req) => WireValue::fields([(
                "referenced_deltas",
                deltas_to_wire(&req.referenced_deltas),
            )]),
        }
    }

    pub(crate) fn from_wire(kind: RequestKind, value: &WireValue) -> ProtocolResult<Self> {
        Ok(match kind {
            RequestKind::GetData => RequestBody::GetData(RecordTarget::from_wire(value)?),
            RequestKind::SubscribeDataUpdates => {
                RequestBody::SubscribeDataUpdates(RecordTarget::from_wire(value)?)
            }
            RequestKind::UnsubscribeDataUpdates => {
                RequestBody::UnsubscribeDataUpdates(RecordTarget::from_wire(value)?)
            }
            RequestKind::SubscribeEvent => {
                RequestBody::SubscribeEvent(EventChannelTarget::from_wire(value)?)
            }
            RequestKind::UnsubscribeEvent => {
                RequestBody::UnsubscribeEvent(EventChannelTarget::from_wire(value)?)
            }
            RequestKind::CallMethod => {
                let f = Fields::of(value, "CallMethodRequest")?;
                RequestBody::CallMethod(CallMethodRequest {
                    target: f.encoded("target")?,
                    method_id: f.u32("method_id")?,
                    arguments: f
                        .list("arguments")?
                        .iter()
                        .map(EncodedValue::from_wire)
                        .collect::<Result<_, _>>()?,
                    referenced_deltas: deltas_from_wire(f.list("referenced_deltas")?)?,
                })
            }
            RequestKind::SaveData => {
                let f = Fields::of(value, "SaveDataRequest")?;
                RequestBody::SaveData(SaveDataRequest {
                    referenced_deltas: deltas_from_wire(f.list("referenced_deltas")?)?,
                })
            }
        })
    }
}

/// Successful GetData result.
#[derive(Debug, Clone, PartialEq)]
pub struct GetDataResponse {
    /// Full snapshot; `deleted` set when the record does not exist.
    pub snapshot: DeltaData,
}

impl GetDataResponse {
    /// Converts to a wire map.
    pub fn to_wire(&self) -> WireValue {
        WireValue::fields([("snapshot", self.snapshot.to_wire())])
    }

    /// Parses a wire map.
    pub fn from_wire(value: &WireValue) -> ProtocolResult<Self> {
        let f = Fields::of(value, "GetDataResponse")?;
        Ok(Self {
            snapshot: DeltaData::from_wire(f.require("snapshot")?)?,
        })
    }
}

/// Successful CallMethod result.
#[derive(Debug, Clone, PartialEq)]
pub struct CallMethodResponse {
    /// The method's return value.
    pub return_value: EncodedValue,
}

impl CallMethodResponse {
    /// Converts to a wire map.
    pub fn to_wire(&self) -> WireValue {
        WireValue::fields([("return_value", self.return_value.to_wire())])
    }

    /// Parses a wire map. A missing return value decodes as undefined.
    pub fn from_wire(value: &WireValue) -> ProtocolResult<Self> {
        let f = Fields::of(value, "CallMethodResponse")?;
        let return_value = if f.has("return_value") {
            f.encoded("return_value")?
        } else {
            EncodedValue::undefined()
        };
        Ok(Self { return_value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_codec::TypeTag;

    #[test]
    fn delta_wire_shape() {
        let delta = DeltaData {
            deleted_property_names: vec!["old".into()],
            ..DeltaData::update(5, "u1", 2, vec![Property::new("name", EncodedValue::string("Sam"))])
        };
        let parsed = DeltaData::from_wire(&delta.to_wire()).unwrap();
        assert_eq!(parsed, delta);
    }

    #[test]
    fn deletion_drops_change_fields() {
        let wire = DeltaData::deletion(5, "u1", 4).to_wire();
        assert!(wire.get("changed_properties").is_none());
        let parsed = DeltaData::from_wire(&wire).unwrap();
        assert!(parsed.deleted);
        assert!(parsed.changed_properties.is_empty());
    }

    #[test]
    fn delta_missing_field() {
        let wire = WireValue::fields([("class_id", WireValue::Integer(1))]);
        assert_eq!(
            DeltaData::from_wire(&wire),
            Err(ProtocolError::MissingField {
                context: "DeltaData",
                field: "primary_key"
            })
        );
    }

    #[test]
    fn event_message_shape() {
        let msg = ServerMessage::Event(EventMessage {
            class_id: 9,
            source: EncodedValue::reference(TypeTag::CallableRef, 3, "svc").unwrap(),
            properties: vec![Property::new("n", EncodedValue::number(1.0))],
            deltas: vec![DeltaData::update(5, "u1", 1, vec![])],
        });
        assert_eq!(ServerMessage::from_wire(&msg.to_wire()).unwrap(), msg);
    }

    #[test]
    fn unknown_message_kind() {
        let wire = WireValue::fields([("kind", WireValue::Integer(77))]);
        assert_eq!(
            ServerMessage::from_wire(&wire),
            Err(ProtocolError::UnknownMessageKind(77))
        );
    }

    #[test]
    fn request_kind_codes() {
        for code in 1..=7 {
            assert_eq!(u64::from(RequestKind::from_code(code).unwrap().to_code()), code);
        }
        assert_eq!(
            RequestKind::from_code(0),
            Err(ProtocolError::UnknownRequestKind(0))
        );
    }

    #[test]
    fn call_method_without_return_value() {
        let wire = WireValue::fields(Vec::<(&str, WireValue)>::new());
        let response = CallMethodResponse::from_wire(&wire).unwrap();
        assert_eq!(response.return_value.tag, TypeTag::Undefined);
    }
}
