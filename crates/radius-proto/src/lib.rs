//! RADIUS Protocol Implementation
//!
//! Wire codec for the RADIUS AAA server: packet encoding and decoding
//! (RFC 2865), accounting status values (RFC 2866), dynamic authorization
//! codes (RFC 5176), authenticator calculation, User-Password hiding and
//! Vendor-Specific attribute framing.
//!
//! # Example
//!
//! ```rust
//! use radius_proto::{Attribute, AttributeType, Code, Packet};
//! use radius_proto::auth::{encrypt_user_password, generate_request_authenticator};
//!
//! let req_auth = generate_request_authenticator();
//! let mut packet = Packet::new(Code::AccessRequest, 1, req_auth);
//! packet.add_attribute(Attribute::string(AttributeType::UserName as u8, "alice").unwrap());
//!
//! let encrypted_pwd = encrypt_user_password("password", b"secret", &req_auth);
//! packet.add_attribute(Attribute::new(AttributeType::UserPassword as u8, encrypted_pwd).unwrap());
//!
//! let bytes = packet.encode().unwrap();
//! assert_eq!(Packet::decode(&bytes).unwrap(), packet);
//! ```

pub mod accounting;
pub mod attributes;
pub mod auth;
pub mod packet;

pub use accounting::AcctStatusType;
pub use attributes::{Attribute, AttributeType, VendorAttribute};
pub use auth::{
    calculate_request_authenticator, calculate_response_authenticator, decrypt_user_password,
    encrypt_user_password, generate_request_authenticator, verify_request_authenticator,
    verify_response_authenticator,
};
pub use packet::{Code, Packet, PacketError};
