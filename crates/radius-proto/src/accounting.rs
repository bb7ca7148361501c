//! RADIUS accounting status values (RFC 2866 Section 5.1)

use crate::attributes::AttributeType;
use crate::packet::Packet;

/// Acct-Status-Type values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AcctStatusType {
    /// Start (1) - Session has begun
    Start = 1,
    /// Stop (2) - Session has ended
    Stop = 2,
    /// Interim-Update (3) - Periodic update during session
    InterimUpdate = 3,
    /// Accounting-On (7) - NAS is ready
    AccountingOn = 7,
    /// Accounting-Off (8) - NAS is shutting down
    AccountingOff = 8,
}

impl AcctStatusType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(AcctStatusType::Start),
            2 => Some(AcctStatusType::Stop),
            3 => Some(AcctStatusType::InterimUpdate),
            7 => Some(AcctStatusType::AccountingOn),
            8 => Some(AcctStatusType::AccountingOff),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Read the Acct-Status-Type attribute of an Accounting-Request
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        packet
            .find_attribute(AttributeType::AcctStatusType.as_u8())
            .and_then(|attr| attr.as_integer().ok())
            .and_then(Self::from_u32)
    }

    /// Start, Stop and Interim-Update refer to a user session; On/Off to the NAS
    pub fn is_session_status(self) -> bool {
        matches!(
            self,
            AcctStatusType::Start | AcctStatusType::Stop | AcctStatusType::InterimUpdate
        )
    }
}
