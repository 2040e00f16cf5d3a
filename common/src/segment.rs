//! Segment documents as stored in the registry.
//!
//! k:/<namespace>/<protocol-family>/<server_name>  v:json of [`Segment`]
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_NAMESPACE: &str = "/mooncake";

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("segment document has an empty server_name")]
    EmptyServerName,
    #[error("server_name {0} must not contain '/'")]
    InvalidServerName(String),
    #[error("buffer with an empty file_path in segment {0}")]
    EmptyFilePath(String),
    #[error("file_path {file_path} appears more than once in segment {server_name}")]
    DuplicateFilePath {
        server_name: String,
        file_path: String,
    },
    #[error("document under {key} names server {server_name}")]
    NameMismatch { key: String, server_name: String },
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "NVMeoF")]
    NvmeOf,
    #[serde(rename = "rdma")]
    Rdma,
}

impl Protocol {
    /// Path component used in the registry key.
    pub fn family(&self) -> &'static str {
        match self {
            Protocol::NvmeOf => "nvmeof",
            Protocol::Rdma => "rdma",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::NvmeOf => f.write_str("NVMeoF"),
            Protocol::Rdma => f.write_str("rdma"),
        }
    }
}

impl FromStr for Protocol {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nvmeof" => Ok(Protocol::NvmeOf),
            "rdma" => Ok(Protocol::Rdma),
            _ => Err(DocumentError::UnknownProtocol(s.to_string())),
        }
    }
}

/// One exposed file or region of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    pub file_path: String,
    pub length: u64,
    /// consumer host -> local mount path
    pub local_path_map: BTreeMap<String, String>,
}

impl BufferDescriptor {
    pub fn new(file_path: impl Into<String>, length: u64) -> Self {
        Self {
            file_path: file_path.into(),
            length,
            local_path_map: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub server_name: String,
    pub protocol: Protocol,
    pub buffers: Vec<BufferDescriptor>,
}

impl Segment {
    pub fn new(server_name: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            server_name: server_name.into(),
            protocol,
            buffers: Vec::new(),
        }
    }

    pub fn with_buffer(mut self, buffer: BufferDescriptor) -> Self {
        self.buffers.push(buffer);
        self
    }

    pub fn buffer(&self, file_path: &str) -> Option<&BufferDescriptor> {
        self.buffers.iter().find(|b| b.file_path == file_path)
    }

    pub fn buffer_mut(&mut self, file_path: &str) -> Option<&mut BufferDescriptor> {
        self.buffers.iter_mut().find(|b| b.file_path == file_path)
    }

    /// Number of consumer mappings across all buffers.
    pub fn mount_count(&self) -> usize {
        self.buffers.iter().map(|b| b.local_path_map.len()).sum()
    }

    pub fn key(&self, namespace: &str) -> String {
        segment_key(namespace, self.protocol, &self.server_name)
    }

    pub fn validate(&self) -> Result<(), DocumentError> {
        if self.server_name.is_empty() {
            return Err(DocumentError::EmptyServerName);
        }
        // the name is the last key segment
        if self.server_name.contains('/') {
            return Err(DocumentError::InvalidServerName(self.server_name.clone()));
        }
        let mut seen = HashSet::new();
        for buffer in &self.buffers {
            if buffer.file_path.is_empty() {
                return Err(DocumentError::EmptyFilePath(self.server_name.clone()));
            }
            if !seen.insert(buffer.file_path.as_str()) {
                return Err(DocumentError::DuplicateFilePath {
                    server_name: self.server_name.clone(),
                    file_path: buffer.file_path.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>, DocumentError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes and validates a document read from `key`.
    pub fn from_json(key: &str, raw: &[u8]) -> Result<Self, DocumentError> {
        let segment: Segment = serde_json::from_slice(raw)?;
        segment.validate()?;
        if server_name_from_key(key) != Some(segment.server_name.as_str()) {
            return Err(DocumentError::NameMismatch {
                key: key.to_string(),
                server_name: segment.server_name,
            });
        }
        Ok(segment)
    }
}

pub fn segment_key(namespace: &str, protocol: Protocol, server_name: &str) -> String {
    format!(
        "{}/{}/{}",
        namespace.trim_end_matches('/'),
        protocol.family(),
        server_name
    )
}

pub fn server_name_from_key(key: &str) -> Option<&str> {
    key.rsplit('/').next().filter(|name| !name.is_empty())
}
