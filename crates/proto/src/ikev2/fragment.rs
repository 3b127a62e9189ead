//! Encrypted fragment reassembly (RFC 7383)
//!
//! Each SA owns at most one [`FragmentBuffer`]. Fragments are validated
//! and stored as they arrive; the ciphertext is only decrypted once the
//! set is complete, each fragment against its own original header.

use super::constants::{MAX_FRAGMENT_REASSEMBLY_SIZE, MAX_IKE_FRAGMENTS};
use super::crypto::CipherAlgorithm;
use super::error::{Error, Result};
use super::message::SkfHeader;
use tracing::debug;

/// One stored fragment: the associated data of its datagram and the
/// undecrypted `IV || ciphertext || tag` window
#[derive(Debug, Clone)]
pub struct Fragment {
    /// IKE header bytes of the fragment's datagram (AEAD associated data)
    pub aad: Vec<u8>,

    /// IV, ciphertext and tag, still encrypted
    pub data: Vec<u8>,
}

/// Reassembly state for one fragmented message
#[derive(Debug, Clone)]
pub struct FragmentBuffer {
    total: u16,
    count: u16,
    first_next_payload: u8,
    slots: Vec<Option<Fragment>>,
}

/// What to do with an incoming fragment after validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentStatus {
    /// All fragments present; reassemble now
    Complete,
    /// Stored; more fragments outstanding
    MoreNeeded,
}

impl FragmentBuffer {
    fn new(total: u16) -> Self {
        FragmentBuffer {
            total,
            count: 0,
            first_next_payload: 0,
            slots: vec![None; total as usize + 1],
        }
    }

    /// Declared fragment count
    pub fn total(&self) -> u16 {
        self.total
    }

    /// Fragments received so far
    pub fn count(&self) -> u16 {
        self.count
    }

    /// True once every slot is filled
    pub fn is_complete(&self) -> bool {
        self.count == self.total
    }

    /// Next-payload type announced by fragment 1
    pub fn first_next_payload(&self) -> u8 {
        self.first_next_payload
    }

    /// Decrypt every fragment and concatenate the plaintexts
    ///
    /// # Errors
    ///
    /// Returns an error when the set is incomplete, any fragment fails
    /// its integrity check, or the reassembled size exceeds the cap.
    /// The caller discards the whole buffer on error; the peer will
    /// retransmit the set.
    pub fn reassemble(&self, cipher: CipherAlgorithm, key: &[u8]) -> Result<Vec<u8>> {
        if !self.is_complete() {
            return Err(Error::Internal(format!(
                "reassembly of incomplete set {}/{}",
                self.count, self.total
            )));
        }

        let mut plaintext = Vec::new();
        for number in 1..=self.total as usize {
            let frag = self.slots[number]
                .as_ref()
                .ok_or_else(|| Error::Internal(format!("fragment {} missing", number)))?;

            let iv_len = cipher.iv_len();
            if frag.data.len() < iv_len {
                return Err(Error::BufferTooShort {
                    required: iv_len,
                    available: frag.data.len(),
                });
            }
            let (iv, ciphertext) = frag.data.split_at(iv_len);
            let piece = cipher.decrypt(key, iv, ciphertext, &frag.aad)?;

            if plaintext.len() + piece.len() > MAX_FRAGMENT_REASSEMBLY_SIZE {
                return Err(Error::MessageTooLarge(
                    (plaintext.len() + piece.len()) as u32,
                ));
            }
            plaintext.extend_from_slice(&piece);
        }

        Ok(plaintext)
    }
}

/// Validate an incoming fragment against policy and the stored set
///
/// Returns false to drop the fragment. A larger incoming total discards
/// the stored set (the peer lowered its MTU and restarted); a smaller
/// one keeps the stored set and drops the newcomer.
pub fn check_fragment(
    skf: &SkfHeader,
    next_payload: u8,
    policy_allowed: bool,
    peer_advertised: bool,
    stored: &mut Option<FragmentBuffer>,
) -> bool {
    if !policy_allowed {
        debug!("discarding IKE encrypted fragment - fragmentation not allowed by local policy");
        return false;
    }
    if !peer_advertised {
        debug!("discarding IKE encrypted fragment - remote never proposed fragmentation");
        return false;
    }

    debug!(
        number = skf.number,
        total = skf.total,
        next_payload,
        "received IKE encrypted fragment"
    );

    // number must be 1..=total, total bounded, and only fragment 1
    // names the first inner payload.
    if !(skf.number != 0
        && skf.number <= skf.total
        && skf.total <= MAX_IKE_FRAGMENTS
        && (skf.number == 1) != (next_payload == 0))
    {
        debug!("ignoring invalid IKE encrypted fragment");
        return false;
    }

    let Some(buffer) = stored else {
        return true;
    };

    if skf.total != buffer.total {
        if skf.total > buffer.total {
            debug!("discarding saved fragments because this fragment has larger total");
            *stored = None;
            true
        } else {
            debug!("ignoring odd IKE encrypted fragment (total shrank)");
            false
        }
    } else if buffer.slots[skf.number as usize].is_some() {
        debug!("ignoring repeated IKE encrypted fragment");
        false
    } else {
        true
    }
}

/// Store a validated fragment
///
/// `data` is the fragment's `IV || ciphertext || tag` window and `aad`
/// its datagram header bytes. Returns [`FragmentStatus::Complete`] only
/// on first arrival of the final missing fragment.
pub fn collect_fragment(
    skf: &SkfHeader,
    next_payload: u8,
    aad: Vec<u8>,
    data: Vec<u8>,
    stored: &mut Option<FragmentBuffer>,
) -> FragmentStatus {
    let buffer = stored.get_or_insert_with(|| FragmentBuffer::new(skf.total));

    debug_assert!((skf.number as usize) < buffer.slots.len());
    debug_assert!(buffer.slots[skf.number as usize].is_none());

    buffer.slots[skf.number as usize] = Some(Fragment { aad, data });
    if skf.number == 1 {
        buffer.first_next_payload = next_payload;
    }
    buffer.count += 1;

    if buffer.is_complete() {
        FragmentStatus::Complete
    } else {
        FragmentStatus::MoreNeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev2::constants::PayloadType;

    const NP: u8 = PayloadType::IdI as u8;

    fn skf(number: u16, total: u16) -> SkfHeader {
        SkfHeader { number, total }
    }

    fn np_for(number: u16) -> u8 {
        if number == 1 {
            NP
        } else {
            0
        }
    }

    #[test]
    fn test_check_policy_gates() {
        let mut stored = None;
        assert!(!check_fragment(&skf(1, 2), NP, false, true, &mut stored));
        assert!(!check_fragment(&skf(1, 2), NP, true, false, &mut stored));
        assert!(check_fragment(&skf(1, 2), NP, true, true, &mut stored));
    }

    #[test]
    fn test_check_bounds() {
        let mut stored = None;
        // number 0
        assert!(!check_fragment(&skf(0, 2), 0, true, true, &mut stored));
        // number beyond total
        assert!(!check_fragment(&skf(3, 2), 0, true, true, &mut stored));
        // total beyond the cap
        assert!(!check_fragment(
            &skf(1, MAX_IKE_FRAGMENTS + 1),
            NP,
            true,
            true,
            &mut stored
        ));
    }

    #[test]
    fn test_check_first_fragment_next_payload_rule() {
        let mut stored = None;
        // first fragment must name an inner payload
        assert!(!check_fragment(&skf(1, 3), 0, true, true, &mut stored));
        // later fragments must not
        assert!(!check_fragment(&skf(2, 3), NP, true, true, &mut stored));
        // and the conforming shapes pass
        assert!(check_fragment(&skf(1, 3), NP, true, true, &mut stored));
        assert!(check_fragment(&skf(2, 3), 0, true, true, &mut stored));
    }

    #[test]
    fn test_total_grow_discards_stored() {
        let mut stored = None;
        collect_fragment(&skf(1, 3), NP, vec![], vec![1], &mut stored);
        assert_eq!(stored.as_ref().unwrap().total(), 3);

        // Peer restarted with five fragments; stored set goes away.
        assert!(check_fragment(&skf(1, 5), NP, true, true, &mut stored));
        assert!(stored.is_none());
    }

    #[test]
    fn test_total_shrink_drops_fragment() {
        let mut stored = None;
        collect_fragment(&skf(1, 5), NP, vec![], vec![1], &mut stored);
        assert!(!check_fragment(&skf(2, 3), 0, true, true, &mut stored));
        assert_eq!(stored.as_ref().unwrap().total(), 5);
    }

    #[test]
    fn test_duplicate_slot_dropped() {
        let mut stored = None;
        collect_fragment(&skf(2, 3), 0, vec![], vec![1], &mut stored);
        assert!(!check_fragment(&skf(2, 3), 0, true, true, &mut stored));
    }

    #[test]
    fn test_completion_signalled_once_all_arrive() {
        let mut stored = None;
        assert_eq!(
            collect_fragment(&skf(2, 3), np_for(2), vec![], vec![2], &mut stored),
            FragmentStatus::MoreNeeded
        );
        assert_eq!(
            collect_fragment(&skf(3, 3), np_for(3), vec![], vec![3], &mut stored),
            FragmentStatus::MoreNeeded
        );
        assert_eq!(
            collect_fragment(&skf(1, 3), np_for(1), vec![], vec![1], &mut stored),
            FragmentStatus::Complete
        );
        let buffer = stored.unwrap();
        assert_eq!(buffer.first_next_payload(), NP);
        assert_eq!(buffer.count(), 3);
    }

    #[test]
    fn test_reassemble_order_independent() {
        let cipher = CipherAlgorithm::AesGcm128;
        let key = [0x77u8; 16];
        let pieces: [&[u8]; 3] = [b"alpha-", b"beta-", b"gamma"];

        let sealed: Vec<(Vec<u8>, Vec<u8>)> = pieces
            .iter()
            .enumerate()
            .map(|(i, piece)| {
                let aad = vec![i as u8; 28];
                let iv = [i as u8 + 1; 8];
                let ct = cipher.encrypt(&key, &iv, piece, &aad).unwrap();
                let mut data = iv.to_vec();
                data.extend_from_slice(&ct);
                (aad, data)
            })
            .collect();

        for order in [[0usize, 1, 2], [2, 1, 0], [1, 2, 0]] {
            let mut stored = None;
            let mut last = FragmentStatus::MoreNeeded;
            for &i in &order {
                let header = skf(i as u16 + 1, 3);
                last = collect_fragment(
                    &header,
                    np_for(header.number),
                    sealed[i].0.clone(),
                    sealed[i].1.clone(),
                    &mut stored,
                );
            }
            assert_eq!(last, FragmentStatus::Complete);
            let plaintext = stored.unwrap().reassemble(cipher, &key).unwrap();
            assert_eq!(plaintext, b"alpha-beta-gamma");
        }
    }

    #[test]
    fn test_reassemble_rejects_incomplete() {
        let mut stored = None;
        collect_fragment(&skf(1, 2), NP, vec![0; 28], vec![0; 24], &mut stored);
        assert!(stored
            .unwrap()
            .reassemble(CipherAlgorithm::AesGcm128, &[0u8; 16])
            .is_err());
    }

    #[test]
    fn test_reassemble_rejects_corrupt_fragment() {
        let cipher = CipherAlgorithm::AesGcm128;
        let key = [0x77u8; 16];
        let aad = vec![0u8; 28];
        let iv = [1u8; 8];
        let mut data = iv.to_vec();
        data.extend_from_slice(&cipher.encrypt(&key, &iv, b"payload", &aad).unwrap());
        // flip a ciphertext bit
        let n = data.len();
        data[n - 1] ^= 0x80;

        let mut stored = None;
        collect_fragment(&skf(1, 1), NP, aad, data, &mut stored);
        assert!(stored.unwrap().reassemble(cipher, &key).is_err());
    }
}
