/*
 * SPDX-FileCopyrightText: Copyright (c) 2021-2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */
use crate::cidr::CidrError;

/// Stable, wire-independent classification of an [`IpamError`]. Callers that
/// bridge this crate onto a wire protocol map these onto whatever status
/// codes their transport uses; this crate itself has no opinion on HTTP
/// status codes or gRPC codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IpamErrorKind {
    /// Malformed input: a bad CIDR string, an empty token, an out-of-range
    /// prefix length.
    Invalid,
    /// An unknown token, host, network, or blackout was referenced.
    NotFound,
    /// A duplicate token with divergent parameters, a duplicate host name,
    /// or an overlapping blackout.
    Conflict,
    /// No address is available anywhere in the requested scope.
    Exhausted,
    /// The saver callback failed, or an internal invariant was violated.
    Internal,
}

/// The literal message clients key off of to decide whether a failed
/// allocation is worth retrying.
pub const NO_AVAILABLE_IP: &str = "no available IP";

#[derive(thiserror::Error, Debug)]
pub enum IpamError {
    #[error("{0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{NO_AVAILABLE_IP}")]
    Exhausted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl IpamError {
    pub fn kind(&self) -> IpamErrorKind {
        match self {
            IpamError::Invalid(_) => IpamErrorKind::Invalid,
            IpamError::NotFound(_) => IpamErrorKind::NotFound,
            IpamError::Conflict(_) => IpamErrorKind::Conflict,
            IpamError::Exhausted => IpamErrorKind::Exhausted,
            IpamError::Internal(_) => IpamErrorKind::Internal,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        IpamError::Invalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        IpamError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        IpamError::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        IpamError::Internal(msg.into())
    }
}

impl From<CidrError> for IpamError {
    fn from(value: CidrError) -> Self {
        IpamError::Invalid(value.to_string())
    }
}

pub type IpamResult<T> = Result<T, IpamError>;
