//  Copyright 2024. The CBDC Development Community
//
//  Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
//  following conditions are met:
//
//  1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
//  disclaimer.
//
//  2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
//  following disclaimer in the documentation and/or other materials provided with the distribution.
//
//  3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
//  products derived from this software without specific prior written permission.
//
//  THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
//  INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
//  DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
//  SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
//  SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
//  WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
//  USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use crate::{
    locking_shard::TicketNumber,
    replication::{LocalLog, ReplicatedLog, ReplicationError, StateMachine},
};

/// Issues globally unique, monotonically increasing ticket numbers.
/// Replicated so ticket numbers stay monotonic across a coordinator's
/// lifetime, including leader changes.
pub struct TicketMachine {
    next: TicketNumber,
}

impl TicketMachine {
    pub fn new() -> Self {
        // Ticket numbers start at one so zero never identifies a live
        // ticket.
        Self { next: 1 }
    }
}

impl Default for TicketMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for TicketMachine {
    type Command = ();
    type Response = TicketNumber;

    fn apply(&mut self, _command: ()) -> TicketNumber {
        let ticket = self.next;
        self.next += 1;
        ticket
    }

    fn snapshot(&self) -> Vec<u8> {
        self.next.to_le_bytes().to_vec()
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), String> {
        let bytes: [u8; 8] = snapshot.try_into().map_err(|_| "invalid ticket snapshot".to_owned())?;
        self.next = u64::from_le_bytes(bytes);
        Ok(())
    }
}

/// Handle for drawing ticket numbers.
#[derive(Clone)]
pub struct TicketMachineHandle {
    log: LocalLog<TicketMachine>,
}

impl TicketMachineHandle {
    pub fn spawn() -> Self {
        Self {
            log: LocalLog::spawn(TicketMachine::new()),
        }
    }

    pub async fn assign(&self) -> Result<TicketNumber, ReplicationError> {
        self.log.propose(()).await
    }
}
