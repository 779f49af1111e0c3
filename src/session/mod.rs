//! Session manager: handshake, session-code verification, replay defense,
//! key rotation and authenticated framing.

pub mod frame;

use crate::crypto;
use crate::error::{auth_fail, replay, session_code_mismatch, CoreError};
use crate::types::{now_secs, REPLAY_WINDOW};
use frame::KeySet;
use parking_lot::Mutex;
use std::collections::HashMap;

pub const DEFAULT_SALT: &[u8] = b"SentinelFS_Salt_1";
const PENDING_CHALLENGE_TTL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unknown,
    Challenged,
    Authenticated,
    Rejected,
}

/// Open-question fix: both nonces are retained (keyed by client peer id) for
/// the lifetime of the handshake, and entries are evicted by age rather than
/// by map size.
struct PendingChallenge {
    client_nonce: Vec<u8>,
    server_nonce: Vec<u8>,
    created_at: u64,
}

/// Tracks which of the last `REPLAY_WINDOW` sequences have actually been
/// consumed, not just the maximum seen, so an in-window replay of any
/// already-processed sequence (not only ones below the window) is caught.
struct PeerSession {
    auth_state: AuthState,
    highest_seq: u64,
    seen_mask: u128,
    outbound_sequence: u64,
}

impl Default for PeerSession {
    fn default() -> Self {
        Self {
            auth_state: AuthState::Unknown,
            highest_seq: 0,
            seen_mask: 0,
            outbound_sequence: 0,
        }
    }
}

impl PeerSession {
    /// Returns `Err` if `sequence` is a replay (already consumed, or too far
    /// behind `highest_seq` to tell), otherwise records it as seen.
    fn check_and_record_sequence(&mut self, sequence: u64) -> Result<(), CoreError> {
        if self.highest_seq == 0 {
            self.highest_seq = sequence;
            self.seen_mask = 1;
            return Ok(());
        }
        if sequence > self.highest_seq {
            let shift = sequence - self.highest_seq;
            self.seen_mask = if shift >= 128 { 0 } else { self.seen_mask << shift };
            self.seen_mask |= 1;
            self.highest_seq = sequence;
            return Ok(());
        }
        let diff = self.highest_seq - sequence;
        if diff >= REPLAY_WINDOW || diff >= 128 {
            return Err(replay(format!(
                "sequence {sequence} outside replay window (highest_seq={})",
                self.highest_seq
            )));
        }
        let bit = 1u128 << diff;
        if self.seen_mask & bit != 0 {
            return Err(replay(format!("sequence {sequence} already consumed")));
        }
        self.seen_mask |= bit;
        Ok(())
    }
}

struct Keys {
    enc_key: [u8; 32],
    mac_key: [u8; 32],
    aead_enabled: bool,
    rotation_counter: u32,
}

pub struct SessionManager {
    local_peer_id: String,
    session_code: String,
    salt: Vec<u8>,
    keys: Mutex<Option<Keys>>,
    pending_challenges: Mutex<HashMap<String, PendingChallenge>>,
    peers: Mutex<HashMap<String, PeerSession>>,
}

impl SessionManager {
    pub fn new(local_peer_id: impl Into<String>, session_code: impl Into<String>) -> Self {
        let mgr = Self {
            local_peer_id: local_peer_id.into(),
            session_code: session_code.into(),
            salt: DEFAULT_SALT.to_vec(),
            keys: Mutex::new(None),
            pending_challenges: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
        };
        mgr.derive_keys(0);
        mgr
    }

    fn derive_keys(&self, rotation_counter: u32) {
        let salt = crypto::rotated_salt(&self.salt, rotation_counter);
        let master = match crypto::derive_master_argon2id(self.session_code.as_bytes(), &salt) {
            Ok(master) => master,
            Err(_) => crypto::derive_master_pbkdf2(self.session_code.as_bytes(), &salt, crypto::PBKDF2_MIN_ITERATIONS),
        };
        let (enc_key, mac_key) = crypto::split_master(&master);
        *self.keys.lock() = Some(Keys {
            enc_key,
            mac_key,
            aead_enabled: true,
            rotation_counter,
        });
    }

    /// Rebuild `enc_key`/`mac_key` under an incremented salt counter and mark
    /// all peers unauthenticated until the handshake completes again.
    pub fn rotate_keys(&self) {
        let next = self.keys.lock().as_ref().map(|k| k.rotation_counter + 1).unwrap_or(1);
        self.derive_keys(next);
        let mut peers = self.peers.lock();
        for peer in peers.values_mut() {
            peer.auth_state = AuthState::Unknown;
        }
    }

    fn key_set(&self) -> Result<KeySet, CoreError> {
        let keys = self.keys.lock();
        let keys = keys.as_ref().ok_or_else(|| crate::error::internal("session keys not derived"))?;
        Ok(KeySet {
            enc_key: keys.enc_key,
            mac_key: keys.mac_key,
            aead_enabled: keys.aead_enabled,
        })
    }

    fn verify_session_code(&self, other_code: &str) -> Result<(), CoreError> {
        match (self.session_code.is_empty(), other_code.is_empty()) {
            (true, true) => Ok(()),
            (false, false) if self.session_code == other_code => Ok(()),
            _ => Err(session_code_mismatch("session code does not match")),
        }
    }

    fn evict_stale_challenges(&self, pending: &mut HashMap<String, PendingChallenge>) {
        let now = now_secs();
        pending.retain(|_, challenge| now.saturating_sub(challenge.created_at) <= PENDING_CHALLENGE_TTL_SECS);
    }

    /// Client side: build the hello message.
    pub fn build_hello(&self) -> (String, Vec<u8>) {
        let nonce = crypto::random_nonce(16);
        let msg = format!(
            "SENTINEL_HELLO|1|{}|{}|{}",
            self.local_peer_id,
            self.session_code,
            crypto::hex_encode(&nonce)
        );
        (msg, nonce)
    }

    /// Server side: parse hello, record the pending challenge, build the
    /// challenge response.
    pub fn handle_hello(&self, hello: &str) -> Result<String, CoreError> {
        let parts: Vec<&str> = hello.split('|').collect();
        if parts.len() != 5 || parts[0] != "SENTINEL_HELLO" {
            return Err(crate::error::internal("malformed hello message"));
        }
        let client_peer_id = parts[2];
        let peer_session_code = parts[3];
        let client_nonce = crypto::hex_decode(parts[4])?;
        self.verify_session_code(peer_session_code)?;

        let server_nonce = crypto::random_nonce(16);
        {
            let mut pending = self.pending_challenges.lock();
            self.evict_stale_challenges(&mut pending);
            pending.insert(
                client_peer_id.to_string(),
                PendingChallenge {
                    client_nonce: client_nonce.clone(),
                    server_nonce: server_nonce.clone(),
                    created_at: now_secs(),
                },
            );
        }
        self.peers.lock().entry(client_peer_id.to_string()).or_default().auth_state = AuthState::Challenged;

        Ok(format!(
            "SENTINEL_CHALLENGE|1|{}|{}|{}",
            self.local_peer_id,
            crypto::hex_encode(&client_nonce),
            crypto::hex_encode(&server_nonce)
        ))
    }

    /// Client side: parse challenge, build the auth digest message.
    pub fn handle_challenge(&self, challenge: &str, client_peer_id: &str) -> Result<String, CoreError> {
        let parts: Vec<&str> = challenge.split('|').collect();
        if parts.len() != 5 || parts[0] != "SENTINEL_CHALLENGE" {
            return Err(crate::error::internal("malformed challenge message"));
        }
        let server_peer_id = parts[2];
        let client_nonce = crypto::hex_decode(parts[3])?;
        let server_nonce = crypto::hex_decode(parts[4])?;

        let digest = self.compute_auth_digest(&client_nonce, &server_nonce, client_peer_id, server_peer_id)?;
        Ok(format!("SENTINEL_AUTH|1|{}|{}", client_peer_id, crypto::hex_encode(&digest)))
    }

    fn compute_auth_digest(
        &self,
        client_nonce: &[u8],
        server_nonce: &[u8],
        client_peer_id: &str,
        server_peer_id: &str,
    ) -> Result<[u8; 32], CoreError> {
        let mac_key = self.keys.lock().as_ref().ok_or_else(|| crate::error::internal("no keys"))?.mac_key;
        let mut data = Vec::new();
        data.extend_from_slice(client_nonce);
        data.extend_from_slice(server_nonce);
        data.extend_from_slice(client_peer_id.as_bytes());
        data.extend_from_slice(server_peer_id.as_bytes());
        data.extend_from_slice(self.session_code.as_bytes());
        crypto::hmac_sha256(&mac_key, &data)
    }

    /// Server side: verify the client's auth digest against the stored
    /// pending challenge.
    pub fn handle_auth(&self, auth: &str) -> Result<(), CoreError> {
        let parts: Vec<&str> = auth.split('|').collect();
        if parts.len() != 4 || parts[0] != "SENTINEL_AUTH" {
            return Err(crate::error::internal("malformed auth message"));
        }
        let client_peer_id = parts[2];
        let digest = crypto::hex_decode(parts[3])?;

        let challenge = {
            let mut pending = self.pending_challenges.lock();
            self.evict_stale_challenges(&mut pending);
            pending.remove(client_peer_id)
        };
        let challenge = challenge.ok_or_else(|| auth_fail("no pending challenge for peer"))?;

        let expected = self.compute_auth_digest(
            &challenge.client_nonce,
            &challenge.server_nonce,
            client_peer_id,
            &self.local_peer_id,
        )?;

        let mut peers = self.peers.lock();
        let peer = peers.entry(client_peer_id.to_string()).or_default();
        if crypto::constant_time_eq(&expected, &digest) {
            peer.auth_state = AuthState::Authenticated;
            Ok(())
        } else {
            peer.auth_state = AuthState::Rejected;
            Err(auth_fail("auth digest mismatch"))
        }
    }

    pub fn auth_state(&self, peer_id: &str) -> AuthState {
        self.peers.lock().get(peer_id).map(|p| p.auth_state).unwrap_or(AuthState::Unknown)
    }

    pub fn mark_rejected(&self, peer_id: &str) {
        self.peers.lock().entry(peer_id.to_string()).or_default().auth_state = AuthState::Rejected;
    }

    /// Encode an outbound application frame for `peer_id`, advancing its
    /// sequence counter.
    pub fn encode_frame(&self, peer_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, CoreError> {
        let sequence = {
            let mut peers = self.peers.lock();
            let peer = peers.entry(peer_id.to_string()).or_default();
            peer.outbound_sequence += 1;
            peer.outbound_sequence
        };
        frame::encode(&self.key_set()?, sequence, plaintext)
    }

    /// Decode an inbound frame, enforcing the replay window before handing
    /// back plaintext.
    pub fn decode_frame(&self, peer_id: &str, raw: &[u8]) -> Result<Vec<u8>, CoreError> {
        let (sequence, plaintext) = frame::decode(&self.key_set()?, raw)?;

        let mut peers = self.peers.lock();
        let peer = peers.entry(peer_id.to_string()).or_default();
        peer.check_and_record_sequence(sequence)?;
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(client: &SessionManager, server: &SessionManager, client_id: &str) {
        let (hello, _client_nonce) = client.build_hello();
        let challenge = server.handle_hello(&hello).unwrap();
        let auth = client.handle_challenge(&challenge, client_id).unwrap();
        server.handle_auth(&auth).unwrap();
    }

    #[test]
    fn mutual_handshake_authenticates() {
        let client = SessionManager::new("client-1", "shared-code");
        let server = SessionManager::new("server-1", "shared-code");
        handshake(&client, &server, "client-1");
        assert_eq!(server.auth_state("client-1"), AuthState::Authenticated);
    }

    #[test]
    fn mismatched_session_code_rejected() {
        let client = SessionManager::new("client-1", "code-a");
        let server = SessionManager::new("server-1", "code-b");
        let (hello, _) = client.build_hello();
        assert!(server.handle_hello(&hello).is_err());
    }

    #[test]
    fn open_session_code_both_empty() {
        let client = SessionManager::new("client-1", "");
        let server = SessionManager::new("server-1", "");
        handshake(&client, &server, "client-1");
        assert_eq!(server.auth_state("client-1"), AuthState::Authenticated);
    }

    #[test]
    fn replay_rejected() {
        let a = SessionManager::new("a", "code");
        let b = SessionManager::new("b", "code");
        let frame = a.encode_frame("b", b"hello").unwrap();
        let plain = b.decode_frame("a", &frame).unwrap();
        assert_eq!(plain, b"hello");
        // replay the exact same frame
        assert!(b.decode_frame("a", &frame).is_err());
    }

    #[test]
    fn replay_of_earlier_in_window_sequence_rejected() {
        let a = SessionManager::new("a", "code");
        let b = SessionManager::new("b", "code");
        let first = a.encode_frame("b", b"first").unwrap();
        let second = a.encode_frame("b", b"second").unwrap();
        b.decode_frame("a", &first).unwrap();
        b.decode_frame("a", &second).unwrap();
        // replaying "first" after "second" was already consumed must fail,
        // even though its sequence is still within the replay window.
        assert!(b.decode_frame("a", &first).is_err());
    }

    #[test]
    fn frame_roundtrip_many_sequences() {
        let a = SessionManager::new("a", "code");
        let b = SessionManager::new("b", "code");
        for i in 0..10 {
            let frame = a.encode_frame("b", format!("msg-{i}").as_bytes()).unwrap();
            let plain = b.decode_frame("a", &frame).unwrap();
            assert_eq!(plain, format!("msg-{i}").into_bytes());
        }
    }
}
