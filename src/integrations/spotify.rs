use axum::{
    extract::{Path, Query, State},
    http::Method,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    auth::cache_prefix,
    error::{AppError, Result},
    integrations::{str_field, unauthenticated_as},
    provider::Integration,
    upstream::UpstreamRequest,
    AppState,
};

const SPOTIFY: Integration = Integration::Spotify;
const CURRENT_TRACK_TTL: Duration = Duration::from_secs(2);
const QUEUE_TTL: Duration = Duration::from_secs(10);
const QUEUE_LIMIT: usize = 10;
const CONTEXT_TTL: Duration = Duration::from_secs(5 * 60);
const CONTEXT_TYPES: [&str; 4] = ["playlist", "album", "artist", "show"];

#[derive(Debug, Deserialize)]
pub struct VolumeQuery {
    pub volume_percent: i64,
}

#[derive(Debug, Deserialize)]
pub struct SeekQuery {
    pub position_ms: i64,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/current-track", get(current_track))
        .route("/queue", get(queue))
        .route("/context/:context_type/:context_id", get(context))
        .route("/play", post(play))
        .route("/pause", post(pause))
        .route("/next", post(next_track))
        .route("/previous", post(previous_track))
        .route("/volume", post(set_volume))
        .route("/seek", post(seek))
}

async fn current_track(State(state): State<AppState>) -> Result<Json<Value>> {
    let result = state
        .cache
        .get_or_fetch("spotify:current-track", CURRENT_TRACK_TTL, || {
            fetch_current_track(&state)
        })
        .await;

    let payload = unauthenticated_as(
        json!({ "authenticated": false, "playing": false }),
        result,
    )?;
    Ok(Json(payload))
}

async fn fetch_current_track(state: &AppState) -> Result<Value> {
    let player = state
        .upstream
        .get_json(SPOTIFY, UpstreamRequest::get("me/player"))
        .await?;

    if player.is_null() {
        return Ok(json!({
            "authenticated": true,
            "playing": false,
            "message": "No active Spotify device found. Open Spotify and start playing something."
        }));
    }

    let is_episode = str_field(&player, "/currently_playing_type") == Some("episode");
    if !is_episode && player.get("item").is_some_and(|item| !item.is_null()) {
        return Ok(now_playing(&player));
    }

    // The player endpoint leaves `item` empty for podcasts.
    debug!("Spotify is playing an episode, asking currently-playing");
    let episode = state
        .upstream
        .get_json(
            SPOTIFY,
            UpstreamRequest::get("me/player/currently-playing")
                .query("additional_types", "episode"),
        )
        .await?;
    Ok(episode_playing(&player, &episode))
}

fn progress_percent(progress_ms: i64, duration_ms: i64) -> i64 {
    if duration_ms > 0 {
        progress_ms * 100 / duration_ms
    } else {
        0
    }
}

fn now_playing(player: &Value) -> Value {
    let track = &player["item"];
    let progress_ms = player["progress_ms"].as_i64().unwrap_or(0);
    let duration_ms = track["duration_ms"].as_i64().unwrap_or(0);
    let artists: Vec<&str> = track["artists"]
        .as_array()
        .map(|artists| artists.iter().filter_map(|a| a["name"].as_str()).collect())
        .unwrap_or_default();

    json!({
        "authenticated": true,
        "playing": player["is_playing"].as_bool().unwrap_or(false),
        "track": track["name"].as_str().unwrap_or("Unknown"),
        "artist": artists.join(", "),
        "album": str_field(track, "/album/name").unwrap_or("Unknown"),
        "album_art": str_field(track, "/album/images/0/url"),
        "progress": progress_percent(progress_ms, duration_ms),
        "duration_ms": duration_ms,
        "progress_ms": progress_ms,
        "volume_percent": player["device"]["volume_percent"].as_i64().unwrap_or(50),
        "context_type": str_field(player, "/context/type"),
        "context_uri": str_field(player, "/context/uri"),
    })
}

fn episode_playing(player: &Value, episode: &Value) -> Value {
    let item = &episode["item"];
    if item.is_null() {
        return json!({
            "authenticated": true,
            "playing": player["is_playing"].as_bool().unwrap_or(false),
            "track": "Podcast Episode",
            "artist": "Spotify Podcast",
            "album": "Podcast",
            "progress": 0,
        });
    }

    let progress_ms = episode["progress_ms"].as_i64().unwrap_or(0);
    let duration_ms = item["duration_ms"].as_i64().unwrap_or(0);
    let album_art =
        str_field(item, "/images/0/url").or_else(|| str_field(item, "/show/images/0/url"));

    json!({
        "authenticated": true,
        "playing": episode["is_playing"].as_bool().unwrap_or(false),
        "track": item["name"].as_str().unwrap_or("Unknown Episode"),
        "artist": str_field(item, "/show/name").unwrap_or("Unknown Podcast"),
        "album": "Podcast",
        "album_art": album_art,
        "progress": progress_percent(progress_ms, duration_ms),
        "duration_ms": duration_ms,
        "progress_ms": progress_ms,
    })
}

async fn queue(State(state): State<AppState>) -> Result<Json<Value>> {
    let payload = state
        .cache
        .get_or_fetch("spotify:queue", QUEUE_TTL, || async {
            let raw = state
                .upstream
                .get_json(SPOTIFY, UpstreamRequest::get("me/player/queue"))
                .await?;
            Ok(json!({ "queue": queue_items(&raw) }))
        })
        .await?;
    Ok(Json(payload))
}

fn queue_items(raw: &Value) -> Vec<Value> {
    let Some(items) = raw["queue"].as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .take(QUEUE_LIMIT)
        .map(|item| {
            let artist = match item["artists"].as_array() {
                Some(artists) => artists
                    .iter()
                    .filter_map(|a| a["name"].as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                None => str_field(item, "/show/name").unwrap_or("Unknown").to_string(),
            };
            json!({
                "name": item["name"].as_str().unwrap_or("Unknown"),
                "artist": artist,
                "album_art": str_field(item, "/album/images/0/url")
                    .or_else(|| str_field(item, "/images/0/url")),
                "duration_ms": item["duration_ms"],
                "uri": item["uri"],
            })
        })
        .collect()
}

/// Name and size of the playlist, album, artist or show being played from.
/// Lookup failures answer `null` so the widget can hide the label.
async fn context(
    State(state): State<AppState>,
    Path((context_type, context_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    if !CONTEXT_TYPES.contains(&context_type.as_str()) {
        return Err(AppError::BadRequest(format!(
            "unsupported context type: {context_type}"
        )));
    }
    if context_id.is_empty() || !context_id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::BadRequest("invalid context id".into()));
    }

    let key = format!("spotify:context:{context_type}:{context_id}");
    let result = state
        .cache
        .get_or_fetch(&key, CONTEXT_TTL, || async {
            let raw = state
                .upstream
                .get_json(
                    SPOTIFY,
                    UpstreamRequest::get(format!("{context_type}s/{context_id}")),
                )
                .await?;
            Ok(context_summary(&context_type, &raw))
        })
        .await;

    match result {
        Ok(payload) => Ok(Json(payload)),
        Err(e @ (AppError::Authentication(_) | AppError::Refresh(_))) => Err(e),
        Err(e) => {
            warn!("Spotify {} lookup failed: {}", context_type, e);
            Ok(Json(Value::Null))
        }
    }
}

fn context_summary(context_type: &str, raw: &Value) -> Value {
    let is_playlist = context_type == "playlist";
    let owner = if is_playlist {
        str_field(raw, "/owner/display_name")
    } else {
        None
    };
    let total_tracks = if is_playlist {
        raw.pointer("/tracks/total")
    } else {
        raw.get("total_tracks")
    };

    json!({
        "name": raw["name"],
        "type": context_type,
        "owner": owner,
        "total_tracks": total_tracks,
    })
}

// Playback commands invalidate cached player state so the next poll sees
// the change.
async fn command(state: &AppState, request: UpstreamRequest) -> Result<()> {
    let mut request = request;
    // Spotify insists on a Content-Length for PUT/POST
    request.body = Some(Bytes::new());
    state.upstream.send(SPOTIFY, request).await?;
    state.cache.invalidate_prefix(&cache_prefix(SPOTIFY));
    Ok(())
}

async fn play(State(state): State<AppState>) -> Result<Json<Value>> {
    command(&state, UpstreamRequest::new(Method::PUT, "me/player/play")).await?;
    Ok(Json(json!({ "status": "success", "message": "Playback started" })))
}

async fn pause(State(state): State<AppState>) -> Result<Json<Value>> {
    command(&state, UpstreamRequest::new(Method::PUT, "me/player/pause")).await?;
    Ok(Json(json!({ "status": "success", "message": "Playback paused" })))
}

async fn next_track(State(state): State<AppState>) -> Result<Json<Value>> {
    command(&state, UpstreamRequest::new(Method::POST, "me/player/next")).await?;
    Ok(Json(json!({ "status": "success", "message": "Skipped to next track" })))
}

async fn previous_track(State(state): State<AppState>) -> Result<Json<Value>> {
    command(&state, UpstreamRequest::new(Method::POST, "me/player/previous")).await?;
    Ok(Json(json!({ "status": "success", "message": "Skipped to previous track" })))
}

async fn set_volume(
    State(state): State<AppState>,
    Query(query): Query<VolumeQuery>,
) -> Result<Json<Value>> {
    if !(0..=100).contains(&query.volume_percent) {
        return Err(AppError::BadRequest("volume must be between 0 and 100".into()));
    }
    command(
        &state,
        UpstreamRequest::new(Method::PUT, "me/player/volume")
            .query("volume_percent", query.volume_percent),
    )
    .await?;
    Ok(Json(json!({ "success": true, "volume": query.volume_percent })))
}

async fn seek(State(state): State<AppState>, Query(query): Query<SeekQuery>) -> Result<Json<Value>> {
    if query.position_ms < 0 {
        return Err(AppError::BadRequest("position must not be negative".into()));
    }
    command(
        &state,
        UpstreamRequest::new(Method::PUT, "me/player/seek").query("position_ms", query.position_ms),
    )
    .await?;
    Ok(Json(json!({ "success": true, "position_ms": query.position_ms })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_fields_are_flattened() {
        let player = json!({
            "is_playing": true,
            "progress_ms": 30000,
            "currently_playing_type": "track",
            "device": { "volume_percent": 70 },
            "context": { "type": "playlist", "uri": "spotify:playlist:1" },
            "item": {
                "name": "Song",
                "duration_ms": 120000,
                "artists": [{ "name": "A" }, { "name": "B" }],
                "album": { "name": "Album", "images": [{ "url": "https://img/1" }] }
            }
        });

        let payload = now_playing(&player);

        assert_eq!(payload["artist"], "A, B");
        assert_eq!(payload["progress"], 25);
        assert_eq!(payload["album_art"], "https://img/1");
        assert_eq!(payload["volume_percent"], 70);
        assert_eq!(payload["context_type"], "playlist");
    }

    #[test]
    fn episode_falls_back_to_show_art_and_generic_labels() {
        let player = json!({ "is_playing": true, "currently_playing_type": "episode", "item": null });
        let episode = json!({
            "is_playing": true,
            "progress_ms": 0,
            "item": {
                "name": "Ep 1",
                "duration_ms": 1000,
                "images": [],
                "show": { "name": "Show", "images": [{ "url": "https://img/show" }] }
            }
        });

        let payload = episode_playing(&player, &episode);
        assert_eq!(payload["artist"], "Show");
        assert_eq!(payload["album_art"], "https://img/show");

        let unknown = episode_playing(&player, &json!({ "item": null }));
        assert_eq!(unknown["track"], "Podcast Episode");
        assert_eq!(unknown["playing"], true);
    }

    #[test]
    fn queue_is_capped() {
        let items: Vec<Value> = (0..15)
            .map(|i| json!({ "name": format!("Song {i}"), "artists": [{ "name": "X" }] }))
            .collect();

        let queue = queue_items(&json!({ "queue": items }));

        assert_eq!(queue.len(), QUEUE_LIMIT);
        assert_eq!(queue[0]["name"], "Song 0");
        assert_eq!(queue[0]["artist"], "X");
    }

    #[test]
    fn context_owner_and_size_depend_on_type() {
        let playlist = json!({
            "name": "Focus",
            "owner": { "display_name": "me" },
            "tracks": { "total": 42 }
        });
        let album = json!({
            "name": "Album",
            "owner": { "display_name": "ignored" },
            "total_tracks": 11
        });

        assert_eq!(
            context_summary("playlist", &playlist),
            json!({ "name": "Focus", "type": "playlist", "owner": "me", "total_tracks": 42 })
        );
        assert_eq!(
            context_summary("album", &album),
            json!({ "name": "Album", "type": "album", "owner": null, "total_tracks": 11 })
        );
    }
}
