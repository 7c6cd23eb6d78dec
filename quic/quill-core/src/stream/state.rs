// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::state::{event, is};

//= https://www.rfc-editor.org/rfc/rfc9000#section-3.1
//#    o
//#    | Create Stream (Sending)
//#    | Peer Creates Bidirectional Stream
//#    v
//#    +-------+
//#    | Ready | Send RESET_STREAM
//#    |       |-----------------------.
//#    +-------+                       |
//#        |                           |
//#        | Send STREAM /             |
//#        |      STREAM_DATA_BLOCKED  |
//#        v                           |
//#    +-------+                       |
//#    | Send  | Send RESET_STREAM     |
//#    |       |---------------------->|
//#    +-------+                       |
//#        |                           |
//#        | Send STREAM + FIN         |
//#        v                           v
//#    +-------+                   +-------+
//#    | Data  | Send RESET_STREAM | Reset |
//#    | Sent  |------------------>| Sent  |
//#    +-------+                   +-------+
//#        |                           |
//#        | Recv All ACKs             | Recv ACK
//#        v                           v
//#    +-------+                   +-------+
//#    | Data  |                   | Reset |
//#    | Recvd |                   | Recvd |
//#    +-------+                   +-------+

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Sender {
    #[default]
    Ready,
    Send,
    DataSent,
    DataRecvd,
    ResetSent,
    ResetRecvd,
}

impl Sender {
    is!(is_ready, Ready);
    is!(is_sending, Send);
    is!(is_data_sent, DataSent);
    is!(is_reset_sent, ResetSent);
    is!(
        /// No further send-side activity can occur
        is_terminal,
        DataRecvd | ResetRecvd
    );
    is!(is_resetting, ResetSent | ResetRecvd);

    event! {
        on_send_stream(Ready => Send);
        /// The FIN may be sent straight from Ready on an empty stream
        on_send_fin(Ready | Send => DataSent);
        on_all_data_acked(DataSent => DataRecvd);
        on_send_reset(Ready | Send | DataSent => ResetSent);
        on_reset_acked(ResetSent => ResetRecvd);
    }
}

//= https://www.rfc-editor.org/rfc/rfc9000#section-3.2
//#    o
//#    | Recv STREAM / STREAM_DATA_BLOCKED / RESET_STREAM
//#    | Create Bidirectional Stream (Sending)
//#    | Recv MAX_STREAM_DATA / STOP_SENDING (Bidirectional)
//#    | Create Higher-Numbered Stream
//#    v
//#    +-------+
//#    | Recv  | Recv RESET_STREAM
//#    |       |-----------------------.
//#    +-------+                       |
//#        |                           |
//#        | Recv STREAM + FIN         |
//#        v                           |
//#    +-------+                       |
//#    | Size  | Recv RESET_STREAM     |
//#    | Known |---------------------->|
//#    +-------+                       |
//#        |                           |
//#        | Recv All Data             |
//#        v                           v
//#    +-------+ Recv RESET_STREAM +-------+
//#    | Data  |--- (optional) --->| Reset |
//#    | Recvd |                   | Recvd |
//#    +-------+                   +-------+
//#        |                           |
//#        | App Read All Data         | App Read Reset
//#        v                           v
//#    +-------+                   +-------+
//#    | Data  |                   | Reset |
//#    | Read  |                   | Read  |
//#    +-------+                   +-------+

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Receiver {
    #[default]
    Recv,
    SizeKnown,
    DataRecvd,
    DataRead,
    ResetRecvd,
    ResetRead,
}

impl Receiver {
    is!(is_receiving, Recv);
    is!(is_size_known, SizeKnown);
    is!(is_data_received, DataRecvd);
    is!(
        /// No further receive-side activity can occur
        is_terminal,
        DataRead | ResetRead
    );
    is!(is_reset, ResetRecvd | ResetRead);

    event! {
        on_fin_received(Recv => SizeKnown);
        on_all_data_received(SizeKnown => DataRecvd);
        on_all_data_read(DataRecvd => DataRead);
        on_reset_received(Recv | SizeKnown => ResetRecvd);
        on_reset_read(ResetRecvd => ResetRead);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_happy_path() {
        let mut state = Sender::default();
        assert!(state.is_ready());
        state.on_send_stream().unwrap();
        state.on_send_fin().unwrap();
        state.on_all_data_acked().unwrap();
        assert!(state.is_terminal());

        // no events are valid in a terminal state
        assert!(state.on_send_stream().is_err());
        assert!(state.on_send_reset().is_err());
    }

    #[test]
    fn sender_reset_path() {
        let mut state = Sender::default();
        state.on_send_stream().unwrap();
        state.on_send_reset().unwrap();
        assert!(state.is_reset_sent());
        // re-queueing a reset is a no-op, not a violation
        assert!(matches!(
            state.on_send_reset(),
            Err(crate::state::Error::NoOp { .. })
        ));
        state.on_reset_acked().unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn receiver_paths() {
        let mut state = Receiver::default();
        state.on_fin_received().unwrap();
        state.on_all_data_received().unwrap();
        state.on_all_data_read().unwrap();
        assert!(state.is_terminal());

        let mut state = Receiver::default();
        state.on_reset_received().unwrap();
        state.on_reset_read().unwrap();
        assert!(state.is_terminal());

        // a reset is not valid once all data was received
        let mut state = Receiver::DataRecvd;
        assert!(state.on_reset_received().is_err());
    }
}
