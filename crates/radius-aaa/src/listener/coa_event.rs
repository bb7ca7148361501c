//! CoA events delivered over the push channel
//!
//! An event names the request code and identifier and carries its
//! attributes as a map of well-known attribute names to values. Values are
//! given either as a string or as a list whose first element is used;
//! traffic class lists are lists of `{name, quota}` objects.
//!
//! ```json
//! {
//!   "code": 43,
//!   "identifier": 123,
//!   "AVPs": {
//!     "Acct-Session-Id": ["session_id"],
//!     "Authorize-Traffic-Classes": [{"name": "video", "quota": 1048576}]
//!   }
//! }
//! ```

use super::ListenerError;
use radius_proto::{Attribute, AttributeType, Code, Packet, VendorAttribute};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Vendor id of the captive portal and traffic class attributes
pub const XWF_VENDOR_ID: u32 = 40981;

pub const XWF_CAPTIVE_PORTAL_TOKEN: u8 = 1;
pub const XWF_VENDOR_CAPTIVE_PORTAL_TOKEN: u8 = 2;
pub const XWF_AUTHORIZE_TRAFFIC_CLASSES: u8 = 3;
pub const XWF_AUTHORIZE_TRAFFIC_CLASSES_ENFORCE: u8 = 4;

/// Sub-attribute types inside a traffic class value
const TRAFFIC_CLASS_NAME: u8 = 1;
const TRAFFIC_CLASS_QUOTA: u8 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoaEvent {
    pub code: u8,
    pub identifier: u8,
    #[serde(default, alias = "AVPs", alias = "avp")]
    pub avps: BTreeMap<String, Value>,
    #[serde(default, alias = "ProxyState", alias = "proxy-state")]
    pub proxy_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TrafficClass {
    pub name: String,
    #[serde(default, deserialize_with = "quota_from_value")]
    pub quota: u64,
}

fn quota_from_value<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| D::Error::custom(format!("invalid quota: {}", n))),
        Value::String(s) => s
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid quota: {}", s))),
        Value::Null => Ok(0),
        other => Err(D::Error::custom(format!("invalid quota: {}", other))),
    }
}

impl TrafficClass {
    /// `name` and `quota` as sub-TLVs (type, length, value)
    fn encode(&self) -> Result<Vec<u8>, ListenerError> {
        let name = self.name.as_bytes();
        if name.len() + 2 > u8::MAX as usize {
            return Err(ListenerError::InvalidEvent(format!(
                "traffic class name too long: {}",
                self.name
            )));
        }

        let mut value = Vec::with_capacity(name.len() + 12);
        value.push(TRAFFIC_CLASS_NAME);
        value.push((name.len() + 2) as u8);
        value.extend_from_slice(name);
        value.push(TRAFFIC_CLASS_QUOTA);
        value.push(10);
        value.extend_from_slice(&self.quota.to_be_bytes());
        Ok(value)
    }
}

impl CoaEvent {
    pub fn parse(data: &str) -> Result<Self, ListenerError> {
        serde_json::from_str(data).map_err(|e| ListenerError::InvalidEvent(e.to_string()))
    }

    /// Request code, restricted to CoA-Request and Disconnect-Request
    pub fn request_code(&self) -> Result<Code, ListenerError> {
        match Code::from_u8(self.code) {
            Some(code) if code.is_dynamic_authorization() => Ok(code),
            _ => Err(ListenerError::InvalidEvent(format!(
                "unsupported code {}",
                self.code
            ))),
        }
    }

    /// Synthesize the request packet; the authenticator is left zeroed
    pub fn to_packet(&self) -> Result<Packet, ListenerError> {
        let mut packet = Packet::new(self.request_code()?, self.identifier, [0u8; 16]);

        for (name, value) in &self.avps {
            match name.as_str() {
                "User-Name" => add_string(&mut packet, AttributeType::UserName, name, value)?,
                "Acct-Session-Id" => {
                    add_string(&mut packet, AttributeType::AcctSessionId, name, value)?
                }
                "Calling-Station-Id" => {
                    add_string(&mut packet, AttributeType::CallingStationId, name, value)?
                }
                "Proxy-State" => add_string(&mut packet, AttributeType::ProxyState, name, value)?,
                "NAS-Identifier" => {
                    add_string(&mut packet, AttributeType::NasIdentifier, name, value)?
                }
                "NAS-IP-Address" => {
                    let raw = scalar(name, value)?;
                    let ip: Ipv4Addr = raw.parse().map_err(|_| {
                        ListenerError::InvalidEvent(format!("invalid NAS-IP-Address: {}", raw))
                    })?;
                    packet.add_attribute(Attribute::ipv4(AttributeType::NasIpAddress.as_u8(), ip)?);
                }
                "Acct-Interim-Interval" => {
                    let raw = scalar(name, value)?;
                    match raw.parse::<u32>() {
                        Ok(interval) => packet.add_attribute(Attribute::integer(
                            AttributeType::AcctInterimInterval.as_u8(),
                            interval,
                        )?),
                        Err(_) => warn!(value = %raw, "Ignoring unparseable Acct-Interim-Interval"),
                    }
                }
                "Captive-Portal-Token" => {
                    add_vendor(&mut packet, XWF_CAPTIVE_PORTAL_TOKEN, scalar(name, value)?)?
                }
                "Vendor-Captive-Portal-Token" => add_vendor(
                    &mut packet,
                    XWF_VENDOR_CAPTIVE_PORTAL_TOKEN,
                    scalar(name, value)?,
                )?,
                "Authorize-Traffic-Classes" => {
                    add_traffic_classes(&mut packet, XWF_AUTHORIZE_TRAFFIC_CLASSES, name, value)?
                }
                "Authorize-Traffic-Classes-Enforce" => add_traffic_classes(
                    &mut packet,
                    XWF_AUTHORIZE_TRAFFIC_CLASSES_ENFORCE,
                    name,
                    value,
                )?,
                other => debug!(attribute = %other, "Ignoring unknown attribute in CoA event"),
            }
        }

        if let Some(proxy_state) = &self.proxy_state {
            packet.add_attribute(Attribute::string(
                AttributeType::ProxyState.as_u8(),
                proxy_state.as_str(),
            )?);
        }

        Ok(packet)
    }
}

/// A string value, or the first element of a list of strings
fn scalar(name: &str, value: &Value) -> Result<String, ListenerError> {
    let value = match value {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    match value {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ListenerError::InvalidEvent(format!(
            "attribute {} has no usable value",
            name
        ))),
    }
}

fn add_string(
    packet: &mut Packet,
    attr_type: AttributeType,
    name: &str,
    value: &Value,
) -> Result<(), ListenerError> {
    packet.add_attribute(Attribute::string(attr_type.as_u8(), scalar(name, value)?)?);
    Ok(())
}

fn add_vendor(packet: &mut Packet, vendor_type: u8, value: String) -> Result<(), ListenerError> {
    packet.add_attribute(VendorAttribute::new(XWF_VENDOR_ID, vendor_type, value).to_attribute()?);
    Ok(())
}

/// One vendor attribute per traffic class in the list
fn add_traffic_classes(
    packet: &mut Packet,
    vendor_type: u8,
    name: &str,
    value: &Value,
) -> Result<(), ListenerError> {
    let classes: Vec<TrafficClass> = serde_json::from_value(value.clone()).map_err(|e| {
        ListenerError::InvalidEvent(format!("attribute {}: {}", name, e))
    })?;

    for class in classes {
        packet.add_attribute(
            VendorAttribute::new(XWF_VENDOR_ID, vendor_type, class.encode()?).to_attribute()?,
        );
    }
    Ok(())
}
