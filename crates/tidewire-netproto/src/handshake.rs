//! JSON payloads exchanged in `Handshake` packets.

use serde::{Deserialize, Serialize};

use crate::{constants::HANDSHAKE_OK, dict::RouteDict, error::ProtoError};

/// Client → server handshake body.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct HandshakeRequest {
    #[serde(rename = "Token", alias = "token")]
    pub token: String,
    #[serde(rename = "GameID", alias = "gameId", alias = "gameID")]
    pub game_id: u32,
    #[serde(rename = "FishLaunchVersion", alias = "fishLaunchVersion")]
    pub fish_launch_version: String,
    #[serde(rename = "Sys", alias = "sys")]
    pub sys: ClientSys,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ClientSys {
    #[serde(rename = "Type", alias = "type")]
    pub kind: String,
    #[serde(rename = "Version", alias = "version")]
    pub version: String,
}

impl HandshakeRequest {
    pub fn from_json(body: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Server → client handshake body.
#[derive(Serialize, Debug)]
pub struct HandshakeResponse<'a> {
    pub code: u16,
    pub sys: ServerSys<'a>,
}

#[derive(Serialize, Debug)]
pub struct ServerSys<'a> {
    /// Heartbeat interval in seconds.
    pub heartbeat: u64,
    pub dict: &'a RouteDict,
    pub version: &'a str,
    #[serde(rename = "payLoad")]
    pub payload: &'a serde_json::Value,
}

impl<'a> HandshakeResponse<'a> {
    pub fn ok(
        heartbeat_secs: u64,
        dict: &'a RouteDict,
        version: &'a str,
        payload: &'a serde_json::Value,
    ) -> Self {
        Self {
            code: HANDSHAKE_OK,
            sys: ServerSys {
                heartbeat: heartbeat_secs,
                dict,
                version,
                payload,
            },
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(serde_json::to_vec(self)?)
    }
}
