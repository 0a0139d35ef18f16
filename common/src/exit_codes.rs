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

use std::fmt;

/// Process exit codes for the daemon binaries. Zero is reserved for clean
/// shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    ConfigError = 101,
    NetworkError = 102,
    StorageError = 103,
    ReplicationError = 104,
    UnknownError = 199,
}

/// Error carrying an exit code and a human-readable detail, returned from a
/// daemon's fallible main.
#[derive(Debug)]
pub struct ExitError {
    pub exit_code: ExitCode,
    pub details: String,
}

impl std::error::Error for ExitError {}

impl ExitError {
    pub fn new(exit_code: ExitCode, details: impl ToString) -> Self {
        Self {
            exit_code,
            details: details.to_string(),
        }
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({}): {}", self.exit_code, self.exit_code as i32, self.details)
    }
}

impl From<crate::config::ConfigError> for ExitError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::new(ExitCode::ConfigError, err)
    }
}
