use crate::prelude::*;
use rand::distributions::Distribution;
use rand::{thread_rng, Rng};

#[derive(Debug)]
pub struct DistinctAlpha;

/// A random value for correlating a redirect with its callback. It is embedded in
/// urls, so it is restricted to the unambiguous alphanumeric set.
pub fn nonce_from_random() -> String {
    thread_rng()
        .sample_iter(&DistinctAlpha)
        .take(SOURCE_NONCE_LEN)
        .collect()
}

/// Build the oauth `state` value for a session. The session id is the prefix so
/// the callback can be routed back to the session that started it.
pub fn state_for_session(session_id: Uuid, nonce: &str) -> String {
    format!("{}.{}", session_id.as_hyphenated(), nonce)
}

/// Split a `state` value back into its session id and nonce.
pub fn split_state(state: &str) -> Option<(Uuid, &str)> {
    let (sid, nonce) = state.split_once('.')?;
    if nonce.is_empty() {
        return None;
    }
    Uuid::parse_str(sid).ok().map(|u| (u, nonce))
}

impl Distribution<char> for DistinctAlpha {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> char {
        const RANGE: u32 = 55;
        const GEN_ASCII_STR_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ\
                abcdefghjkpqrstuvwxyz\
                0123456789";
        loop {
            let var = rng.next_u32() >> (32 - 6);
            if var < RANGE {
                return GEN_ASCII_STR_CHARSET[var as usize] as char;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    use crate::utils::{nonce_from_random, split_state, state_for_session};

    #[test]
    fn test_utils_state_roundtrip() {
        let sid = Uuid::new_v4();
        let nonce = nonce_from_random();
        assert_eq!(nonce.len(), SOURCE_NONCE_LEN);

        let state = state_for_session(sid, &nonce);
        let (parsed_sid, parsed_nonce) = split_state(&state).expect("state did not parse");
        assert_eq!(parsed_sid, sid);
        assert_eq!(parsed_nonce, nonce);
    }

    #[test]
    fn test_utils_state_rejects_garbage() {
        assert!(split_state("").is_none());
        assert!(split_state("not-a-uuid.abc").is_none());
        assert!(split_state(&format!("{}.", Uuid::new_v4())).is_none());
        assert!(split_state(&Uuid::new_v4().to_string()).is_none());
    }
}
