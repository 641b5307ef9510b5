// Copyright 2024 The Pixfetch Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};

#[macro_export]
macro_rules! make_err {
    ($code:expr, $($arg:tt)+) => {{
        $crate::Error::new(
            $code,
            format!("{}", format_args!($($arg)+)),
        )
    }};
}

#[macro_export]
macro_rules! make_input_err {
    ($($arg:tt)+) => {{
        $crate::make_err!($crate::Code::InvalidArgument, $($arg)+)
    }};
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    pub code: Code,
    pub messages: Vec<String>,
}

impl Error {
    pub fn new(code: Code, msg: String) -> Self {
        let mut msgs = Vec::with_capacity(1);
        if !msg.is_empty() {
            msgs.push(msg);
        }
        Error { code, messages: msgs }
    }

    #[must_use]
    pub fn append<S: Into<String>>(mut self, msg: S) -> Self {
        self.messages.push(msg.into());
        self
    }

    /// Concatenates the message chains, keeping this error's code.
    #[must_use]
    pub fn merge<E: Into<Error>>(mut self, other: E) -> Self {
        let mut other: Error = other.into();
        // This will help with knowing which messages are tied to different
        // errors.
        self.messages.push("---".to_string());
        self.messages.append(&mut other.messages);
        self
    }

    pub fn merge_option<T: Into<Error>, U: Into<Error>>(
        this: Option<T>,
        other: Option<U>,
    ) -> Option<Error> {
        if let Some(this) = this {
            if let Some(other) = other {
                return Some(this.into().merge(other));
            }
            return Some(this.into());
        }
        other.map(Into::into)
    }

    pub fn messages_string(&self) -> String {
        self.messages.join(" : ")
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // Message is generally under 'messages', so this is mostly to get
        // a stable, test-friendly form.
        write!(f, "Error {{ code: {:?}, messages: {:?} }}", self.code, self.messages)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            code: err.kind().into(),
            messages: vec![err.to_string()],
        }
    }
}

impl From<Code> for Error {
    fn from(code: Code) -> Self {
        make_err!(code, "")
    }
}

impl From<std::io::ErrorKind> for Code {
    fn from(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => Code::NotFound,
            std::io::ErrorKind::PermissionDenied => Code::CannotLoadFromDisk,
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                Code::InvalidArgument
            }
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted => Code::Unavailable,
            std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => Code::TransportError,
            _ => Code::Internal,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() || err.is_connect() {
            Code::TransportError
        } else if err.is_builder() || err.is_request() {
            Code::InvalidUrl
        } else {
            Code::TransportError
        };
        make_err!(code, "{}", err)
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        make_err!(Code::DecodeFailed, "{}", err)
    }
}

/// The failure kinds an image retrieval can surface. These are deliberately
/// coarse categories; details ride along in `Error::messages`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    // Request construction.
    InvalidUrl,
    EmptyRequest,
    TaskCancelled,

    // Transport responses.
    InvalidStatusCode,
    TransportError,
    DataModifyingFailed,
    CancelledByDelegate,
    NotModified,
    ConstrainedNetwork,

    // Cache.
    CannotCreateDirectory,
    CannotLoadFromDisk,
    CannotSerializeImage,
    InvalidKey,
    NotCached,
    NotFound,

    // Decode / processing.
    DecodeFailed,
    ProcessingFailed,

    // Source binding.
    EmptySource,
    NotCurrentSourceTask,
    AlternativeSourcesExhausted,

    // General.
    InvalidArgument,
    Unavailable,
    Internal,
}

impl Code {
    /// Whether a failure of this kind may be recovered by retrying the same
    /// request or falling over to an alternative source.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Code::TransportError
                | Code::Unavailable
                | Code::InvalidStatusCode
                | Code::ConstrainedNetwork
        )
    }
}

pub trait ResultExt<T> {
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: Into<String>,
        F: (FnOnce(&Error) -> (Code, S)) + Sized;

    fn err_tip<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: Into<String>,
        F: (FnOnce() -> S) + Sized,
    {
        self.err_tip_with_code(|e| (e.code, tip_fn()))
    }

    fn merge<U>(self, _other: Result<U, Error>) -> Result<U, Error>
    where
        Self: Sized,
    {
        unreachable!();
    }
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: Into<String>,
        F: (FnOnce(&Error) -> (Code, S)) + Sized,
    {
        self.map_err(|e| {
            let mut error: Error = e.into();
            let (code, message) = tip_fn(&error);
            error.code = code;
            error.messages.push(message.into());
            error
        })
    }

    fn merge<U>(self, other: Result<U, Error>) -> Result<U, Error>
    where
        Self: Sized,
    {
        if let Err(e) = self {
            let mut e: Error = e.into();
            if let Err(other_err) = other {
                e = e.merge(other_err);
            }
            return Err(e);
        }
        other
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: Into<String>,
        F: (FnOnce(&Error) -> (Code, S)) + Sized,
    {
        self.ok_or_else(|| {
            let mut error = Error {
                code: Code::Internal,
                messages: vec![],
            };
            let (code, message) = tip_fn(&error);
            error.code = code;
            error.messages.push(message.into());
            error
        })
    }
}
