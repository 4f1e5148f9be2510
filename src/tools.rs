//! Various helper functions commonly used across the crate.

use anyhow::anyhow;
use serde::de;

use matrix_sdk::ruma::{OwnedRoomAliasId, OwnedRoomId};
use matrix_sdk::{Client, Room};

use reqwest::Client as RClient;

/// Shorthand for making an http request to retrieve a json object, and deserialize it.
pub async fn fetch_and_decode_json<D: de::DeserializeOwned>(url: String) -> anyhow::Result<D> {
    let client = RClient::new();

    let data = client.get(url).send().await?;

    Ok(data.json::<D>().await?)
}

/// Given a string (either an alias, or a room id), try to resolve it to a room object.
pub async fn maybe_get_room(c: &Client, maybe_room: &str) -> anyhow::Result<Room> {
    let room_id: OwnedRoomId = match maybe_room.try_into() {
        Ok(r) => r,
        Err(_) => {
            let alias_id = OwnedRoomAliasId::try_from(maybe_room)?;

            c.resolve_room_alias(&alias_id).await?.room_id
        }
    };

    c.get_room(&room_id).ok_or(anyhow!("no room"))
}

/// Retrieve the canonical room alias, if known. Otherwise return room id.
pub fn room_name(room: &Room) -> String {
    match room.canonical_alias() {
        Some(a) => a.to_string(),
        None => room.room_id().to_string(),
    }
}

/// Shorter to_string() alias
pub trait ToStringExt: ToString {
    #[allow(missing_docs)]
    fn s(&self) -> String {
        self.to_string()
    }
}

impl<T> ToStringExt for T where T: ToString {}
