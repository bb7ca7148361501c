use crate::packet::{Packet, PacketError};
use rand::Rng;

/// Random Request Authenticator for Access-Request (RFC 2865 Section 3)
pub fn generate_request_authenticator() -> [u8; 16] {
    let mut authenticator = [0u8; 16];
    rand::rng().fill(&mut authenticator);
    authenticator
}

/// MD5 over the encoded packet with its authenticator field replaced by
/// `authenticator`, followed by the shared secret.
fn digest_with_authenticator(
    packet: &Packet,
    authenticator: [u8; 16],
    secret: &[u8],
) -> Result<[u8; 16], PacketError> {
    let mut data = packet.encode()?;
    data[4..20].copy_from_slice(&authenticator);
    data.extend_from_slice(secret);
    Ok(md5::compute(&data).0)
}

/// Response Authenticator per RFC 2865 Section 3
///
/// MD5(Code + ID + Length + Request Authenticator + Attributes + Secret), used
/// for every reply code including Accounting-Response and CoA/Disconnect
/// ACK/NAK (RFC 5176 Section 2.3).
pub fn calculate_response_authenticator(
    packet: &Packet,
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> Result<[u8; 16], PacketError> {
    digest_with_authenticator(packet, *request_authenticator, secret)
}

/// Request Authenticator for Accounting-Request (RFC 2866 Section 3) and
/// CoA/Disconnect-Request (RFC 5176 Section 2.3): the digest is computed with
/// sixteen zero octets in the authenticator field.
pub fn calculate_request_authenticator(
    packet: &Packet,
    secret: &[u8],
) -> Result<[u8; 16], PacketError> {
    digest_with_authenticator(packet, [0u8; 16], secret)
}

pub fn verify_response_authenticator(
    response: &Packet,
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> bool {
    calculate_response_authenticator(response, request_authenticator, secret)
        .map(|expected| expected == response.authenticator)
        .unwrap_or(false)
}

/// Check a computed request authenticator (accounting and dynamic
/// authorization requests)
pub fn verify_request_authenticator(request: &Packet, secret: &[u8]) -> bool {
    calculate_request_authenticator(request, secret)
        .map(|expected| expected == request.authenticator)
        .unwrap_or(false)
}

/// Hide a User-Password value per RFC 2865 Section 5.2
///
/// The password is padded with NULs to a multiple of 16 bytes; each block is
/// XORed with MD5(secret + previous ciphertext block), seeded with the
/// request authenticator.
pub fn encrypt_user_password(password: &str, secret: &[u8], authenticator: &[u8; 16]) -> Vec<u8> {
    let mut padded = password.as_bytes().to_vec();
    let padded_len = padded.len().div_ceil(16).max(1) * 16;
    padded.resize(padded_len, 0);

    let mut result = Vec::with_capacity(padded_len);
    let mut previous: [u8; 16] = *authenticator;

    for chunk in padded.chunks(16) {
        let hash = password_block_key(secret, &previous);
        for (i, byte) in chunk.iter().enumerate() {
            previous[i] = byte ^ hash[i];
        }
        result.extend_from_slice(&previous);
    }

    result
}

/// Recover a User-Password value hidden with [`encrypt_user_password`]
pub fn decrypt_user_password(
    encrypted: &[u8],
    secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<String, PacketError> {
    if encrypted.is_empty() || encrypted.len() % 16 != 0 {
        return Err(PacketError::AttributeError(format!(
            "Invalid encrypted password length: {}",
            encrypted.len()
        )));
    }

    let mut result = Vec::with_capacity(encrypted.len());
    let mut previous: &[u8] = authenticator;

    for chunk in encrypted.chunks(16) {
        let hash = password_block_key(secret, previous);
        result.extend(chunk.iter().zip(hash.iter()).map(|(c, h)| c ^ h));
        previous = chunk;
    }

    while result.last() == Some(&0) {
        result.pop();
    }

    String::from_utf8(result)
        .map_err(|e| PacketError::AttributeError(format!("Invalid UTF-8 in password: {}", e)))
}

fn password_block_key(secret: &[u8], previous: &[u8]) -> [u8; 16] {
    let mut context = md5::Context::new();
    context.consume(secret);
    context.consume(previous);
    context.compute().0
}
