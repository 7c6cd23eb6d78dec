// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection ID management: the source IDs we advertise (with their
//! stateless reset tokens and worker-partition byte) and the
//! destination IDs the peer issued to us.

use quill_core::{
    connection::ConnectionId,
    frame::NewConnectionId,
    stateless_reset,
    transport::Error,
    varint::VarInt,
};

/// A source CID advertised to the peer
#[derive(Clone, Debug)]
pub struct LocalCid {
    pub cid: ConnectionId,
    pub sequence: u64,
    pub reset_token: stateless_reset::Token,
    /// A NEW_CONNECTION_ID frame for this CID is owed to the peer
    pub needs_transmit: bool,
    /// The peer retired it; it only routes stray packets now
    pub retired: bool,
}

/// A destination CID received from the peer
#[derive(Clone, Debug)]
pub struct PeerCid {
    pub cid: ConnectionId,
    pub sequence: u64,
    pub reset_token: Option<stateless_reset::Token>,
    pub retired: bool,
    /// A RETIRE_CONNECTION_ID frame for this sequence is owed
    pub needs_retire_transmit: bool,
}

pub struct CidController {
    local: Vec<LocalCid>,
    peer: Vec<PeerCid>,
    next_local_sequence: u64,
    /// Largest Retire Prior To we have processed
    peer_retire_prior_to: u64,
    /// How many active CIDs the peer lets us advertise
    peer_active_limit: u64,
    /// How many active CIDs we accept from the peer
    local_active_limit: u64,
}

impl CidController {
    /// Starts with the handshake-time pair: our initial source CID
    /// (sequence 0, no reset token per RFC 9000 §5.1.1) and the peer's
    /// initial CID.
    pub fn new(initial_local: ConnectionId, initial_peer: ConnectionId, local_active_limit: u64) -> Self {
        Self {
            local: vec![LocalCid {
                cid: initial_local,
                sequence: 0,
                reset_token: stateless_reset::Token::ZEROED,
                needs_transmit: false,
                retired: false,
            }],
            peer: vec![PeerCid {
                cid: initial_peer,
                sequence: 0,
                reset_token: None,
                retired: false,
                needs_retire_transmit: false,
            }],
            next_local_sequence: 1,
            peer_retire_prior_to: 0,
            peer_active_limit: 2,
            local_active_limit,
        }
    }

    /// Replaces the provisional peer CID with the server's handshake
    /// choice (client only, on the first Initial response)
    pub fn on_peer_cid_rebound(&mut self, cid: ConnectionId) {
        if let Some(initial) = self.peer.iter_mut().find(|c| c.sequence == 0) {
            initial.cid = cid;
        }
    }

    pub fn on_peer_parameters(&mut self, active_connection_id_limit: u64) {
        self.peer_active_limit = active_connection_id_limit;
    }

    /// The destination CID for outgoing packets
    pub fn active_peer_cid(&self) -> &ConnectionId {
        &self
            .peer
            .iter()
            .find(|c| !c.retired)
            .unwrap_or(&self.peer[0])
            .cid
    }

    /// The stateless reset token guarding the active path, if any
    pub fn active_reset_token(&self) -> Option<stateless_reset::Token> {
        self.peer.iter().find(|c| !c.retired)?.reset_token
    }

    pub fn local_cids(&self) -> &[LocalCid] {
        &self.local
    }

    /// Count of source CIDs still advertised
    fn active_local_count(&self) -> u64 {
        self.local.iter().filter(|c| !c.retired).count() as u64
    }

    /// True when another source CID may be issued under the peer's
    /// limit
    pub fn can_issue_local(&self) -> bool {
        self.active_local_count() < self.peer_active_limit
    }

    /// Registers a freshly generated source CID for advertisement.
    /// Returns the sequence it was issued under.
    pub fn issue_local(&mut self, cid: ConnectionId, reset_token: stateless_reset::Token) -> u64 {
        let sequence = self.next_local_sequence;
        self.next_local_sequence += 1;
        self.local.push(LocalCid {
            cid,
            sequence,
            reset_token,
            needs_transmit: true,
            retired: false,
        });
        sequence
    }

    /// Source CIDs whose NEW_CONNECTION_ID frame is pending
    pub fn locals_needing_transmit(&self) -> impl Iterator<Item = &LocalCid> {
        self.local
            .iter()
            .filter(|c| c.needs_transmit && !c.retired)
    }

    pub fn on_new_cid_frame_sent(&mut self, sequence: u64) {
        if let Some(cid) = self.local.iter_mut().find(|c| c.sequence == sequence) {
            cid.needs_transmit = false;
        }
    }

    pub fn on_new_cid_frame_lost(&mut self, sequence: u64) {
        if let Some(cid) = self.local.iter_mut().find(|c| c.sequence == sequence) {
            if !cid.retired {
                cid.needs_transmit = true;
            }
        }
    }

    /// Handles NEW_CONNECTION_ID from the peer. Returns the sequences
    /// whose retirement must now be transmitted.
    pub fn on_new_connection_id_frame(
        &mut self,
        frame: &NewConnectionId,
    ) -> Result<Vec<u64>, Error> {
        let sequence = frame.sequence_number.as_u64();
        let retire_prior_to = frame.retire_prior_to.as_u64();

        if let Some(existing) = self.peer.iter().find(|c| c.sequence == sequence) {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# if a sequence number is used for different connection IDs,
            //# the endpoint MAY treat that receipt as a connection error of
            //# type PROTOCOL_VIOLATION.
            if existing.cid != frame.connection_id {
                return Err(Error::new(Error::PROTOCOL_VIOLATION)
                    .with_reason("sequence number reused for a different connection id"));
            }
            return Ok(Vec::new());
        }

        let retired_on_arrival = sequence < self.peer_retire_prior_to.max(retire_prior_to);
        self.peer.push(PeerCid {
            cid: frame.connection_id,
            sequence,
            reset_token: Some(frame.stateless_reset_token),
            retired: retired_on_arrival,
            needs_retire_transmit: retired_on_arrival,
        });

        let mut newly_retired = Vec::new();
        if retire_prior_to > self.peer_retire_prior_to {
            self.peer_retire_prior_to = retire_prior_to;
            for cid in &mut self.peer {
                if cid.sequence < retire_prior_to && !cid.retired {
                    cid.retired = true;
                    cid.needs_retire_transmit = true;
                    newly_retired.push(cid.sequence);
                }
            }
        }
        if retired_on_arrival {
            newly_retired.push(sequence);
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.1
        //# After processing a NEW_CONNECTION_ID frame and adding and
        //# retiring active connection IDs, if the number of active
        //# connection IDs exceeds the value advertised in its
        //# active_connection_id_limit transport parameter, an endpoint
        //# MUST close the connection with an error of type
        //# CONNECTION_ID_LIMIT_ERROR.
        let active = self.peer.iter().filter(|c| !c.retired).count() as u64;
        if active > self.local_active_limit {
            return Err(Error::new(Error::CONNECTION_ID_LIMIT_ERROR));
        }

        Ok(newly_retired)
    }

    /// Peer CID sequences owing a RETIRE_CONNECTION_ID frame
    pub fn retirements_needing_transmit(&self) -> impl Iterator<Item = u64> + '_ {
        self.peer
            .iter()
            .filter(|c| c.needs_retire_transmit)
            .map(|c| c.sequence)
    }

    pub fn on_retire_frame_sent(&mut self, sequence: u64) {
        if let Some(cid) = self.peer.iter_mut().find(|c| c.sequence == sequence) {
            cid.needs_retire_transmit = false;
        }
    }

    pub fn on_retire_frame_lost(&mut self, sequence: u64) {
        if let Some(cid) = self.peer.iter_mut().find(|c| c.sequence == sequence) {
            if cid.retired {
                cid.needs_retire_transmit = true;
            }
        }
    }

    /// Handles RETIRE_CONNECTION_ID from the peer (retiring one of our
    /// source CIDs). Returns the CID to drop from the lookup.
    pub fn on_retire_connection_id_frame(
        &mut self,
        sequence: VarInt,
        packet_dcid: &ConnectionId,
    ) -> Result<Option<ConnectionId>, Error> {
        let sequence = sequence.as_u64();

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.16
        //# Receipt of a RETIRE_CONNECTION_ID frame containing a sequence
        //# number greater than any previously sent to the peer MUST be
        //# treated as a connection error of type PROTOCOL_VIOLATION.
        if sequence >= self.next_local_sequence {
            return Err(Error::new(Error::PROTOCOL_VIOLATION)
                .with_reason("retired sequence was never issued"));
        }

        let Some(cid) = self.local.iter_mut().find(|c| c.sequence == sequence) else {
            return Ok(None);
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.16
        //# The sequence number specified in a RETIRE_CONNECTION_ID frame
        //# MUST NOT refer to the Destination Connection ID field of the
        //# packet in which the frame is contained.
        if &cid.cid == packet_dcid {
            return Err(Error::new(Error::PROTOCOL_VIOLATION)
                .with_reason("cannot retire the connection id carrying the frame"));
        }

        if cid.retired {
            return Ok(None);
        }
        cid.retired = true;
        Ok(Some(cid.cid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::try_from_slice(bytes).unwrap()
    }

    fn controller() -> CidController {
        CidController::new(cid(&[1; 8]), cid(&[2; 8]), 4)
    }

    fn new_cid_frame(sequence: u64, retire_prior_to: u64, bytes: &[u8]) -> NewConnectionId {
        NewConnectionId {
            sequence_number: VarInt::new(sequence).unwrap(),
            retire_prior_to: VarInt::new(retire_prior_to).unwrap(),
            connection_id: cid(bytes),
            stateless_reset_token: stateless_reset::Token::new([sequence as u8; 16]),
        }
    }

    #[test]
    fn issue_up_to_peer_limit() {
        let mut controller = controller();
        controller.on_peer_parameters(3);

        assert!(controller.can_issue_local());
        controller.issue_local(cid(&[3; 8]), stateless_reset::Token::new([1; 16]));
        assert!(controller.can_issue_local());
        controller.issue_local(cid(&[4; 8]), stateless_reset::Token::new([2; 16]));
        assert!(!controller.can_issue_local());

        let pending: Vec<u64> = controller
            .locals_needing_transmit()
            .map(|c| c.sequence)
            .collect();
        assert_eq!(pending, vec![1, 2]);

        controller.on_new_cid_frame_sent(1);
        let pending: Vec<u64> = controller
            .locals_needing_transmit()
            .map(|c| c.sequence)
            .collect();
        assert_eq!(pending, vec![2]);

        controller.on_new_cid_frame_lost(1);
        assert_eq!(controller.locals_needing_transmit().count(), 2);
    }

    #[test]
    fn retire_prior_to_rotates_active() {
        let mut controller = controller();
        controller
            .on_new_connection_id_frame(&new_cid_frame(1, 0, &[9; 8]))
            .unwrap();
        assert_eq!(controller.active_peer_cid(), &cid(&[2; 8]));

        let retired = controller
            .on_new_connection_id_frame(&new_cid_frame(2, 2, &[10; 8]))
            .unwrap();
        assert_eq!(retired, vec![0, 1]);
        assert_eq!(controller.active_peer_cid(), &cid(&[10; 8]));
        assert_eq!(
            controller.retirements_needing_transmit().collect::<Vec<_>>(),
            vec![0, 1]
        );

        controller.on_retire_frame_sent(0);
        assert_eq!(
            controller.retirements_needing_transmit().collect::<Vec<_>>(),
            vec![1]
        );
    }

    #[test]
    fn peer_cid_limit_enforced() {
        let mut controller = CidController::new(cid(&[1; 8]), cid(&[2; 8]), 2);
        controller
            .on_new_connection_id_frame(&new_cid_frame(1, 0, &[3; 8]))
            .unwrap();
        let error = controller
            .on_new_connection_id_frame(&new_cid_frame(2, 0, &[4; 8]))
            .unwrap_err();
        assert_eq!(error.code, Error::CONNECTION_ID_LIMIT_ERROR);
    }

    #[test]
    fn retire_frame_validation() {
        let mut controller = controller();
        let packet_dcid = cid(&[7; 8]);

        // never-issued sequence
        let error = controller
            .on_retire_connection_id_frame(VarInt::from_u8(5), &packet_dcid)
            .unwrap_err();
        assert_eq!(error.code, Error::PROTOCOL_VIOLATION);

        // retiring the CID that carried the frame
        let error = controller
            .on_retire_connection_id_frame(VarInt::from_u8(0), &cid(&[1; 8]))
            .unwrap_err();
        assert_eq!(error.code, Error::PROTOCOL_VIOLATION);

        // valid retirement returns the CID for lookup removal
        let removed = controller
            .on_retire_connection_id_frame(VarInt::from_u8(0), &packet_dcid)
            .unwrap();
        assert_eq!(removed, Some(cid(&[1; 8])));

        // duplicates are no-ops
        let removed = controller
            .on_retire_connection_id_frame(VarInt::from_u8(0), &packet_dcid)
            .unwrap();
        assert_eq!(removed, None);
    }

    #[test]
    fn duplicate_new_cid_frames() {
        let mut controller = controller();
        let frame = new_cid_frame(1, 0, &[9; 8]);
        controller.on_new_connection_id_frame(&frame).unwrap();
        // exact duplicate is fine
        assert!(controller.on_new_connection_id_frame(&frame).unwrap().is_empty());

        // same sequence, different CID is a violation
        let conflicting = new_cid_frame(1, 0, &[10; 8]);
        let error = controller
            .on_new_connection_id_frame(&conflicting)
            .unwrap_err();
        assert_eq!(error.code, Error::PROTOCOL_VIOLATION);
    }
}
