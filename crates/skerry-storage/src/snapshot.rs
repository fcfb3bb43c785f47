//! Snapshot stream format: one JSON object per line,
//! `{"key":"<utf8>","value":"<base64>"}`, in engine scan order.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use skerry_types::SkerryError;

use crate::traits::Engine;

#[derive(Serialize, Deserialize)]
struct KvPair {
    key: String,
    value: String,
}

/// Serialize the engine's full contents into the newline-JSON stream.
pub async fn export<E: Engine>(engine: &E) -> Result<Vec<u8>, SkerryError> {
    let mut out = Vec::new();
    for (key, value) in engine.scan().await? {
        let key = String::from_utf8(key)
            .map_err(|e| SkerryError::Storage(format!("non-utf8 engine key: {e}")))?;
        let pair = KvPair {
            key,
            value: base64::engine::general_purpose::STANDARD.encode(&value),
        };
        let line = serde_json::to_vec(&pair)
            .map_err(|e| SkerryError::Storage(e.to_string()))?;
        out.extend_from_slice(&line);
        out.push(b'\n');
    }
    Ok(out)
}

/// Replace the engine's logical state with the stream's contents.
pub async fn import<E: Engine>(engine: &E, stream: &[u8]) -> Result<(), SkerryError> {
    engine.clear().await?;
    for line in stream.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        let pair: KvPair = serde_json::from_slice(line)
            .map_err(|e| SkerryError::Storage(format!("malformed snapshot line: {e}")))?;
        let value = base64::engine::general_purpose::STANDARD
            .decode(&pair.value)
            .map_err(|e| SkerryError::Storage(format!("malformed snapshot value: {e}")))?;
        engine.set(pair.key.as_bytes(), &value).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemEngine;

    #[tokio::test]
    async fn export_import_round_trips() {
        let src = MemEngine::new();
        src.set(b"alpha", b"1").await.unwrap();
        src.set(b"beta", &[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();
        src.set(b"gamma", b"").await.unwrap();

        let stream = export(&src).await.unwrap();

        let dst = MemEngine::new();
        dst.set(b"stale", b"gone").await.unwrap();
        import(&dst, &stream).await.unwrap();

        assert_eq!(src.scan().await.unwrap(), dst.scan().await.unwrap());
        assert!(matches!(dst.get(b"stale").await, Err(SkerryError::NotFound)));
    }

    #[tokio::test]
    async fn stream_is_one_json_object_per_line() {
        let src = MemEngine::new();
        src.set(b"k", b"bar").await.unwrap();
        let stream = export(&src).await.unwrap();
        let text = String::from_utf8(stream).unwrap();
        assert_eq!(text, "{\"key\":\"k\",\"value\":\"YmFy\"}\n");
    }

    #[tokio::test]
    async fn empty_engine_exports_empty_stream() {
        let src = MemEngine::new();
        assert!(export(&src).await.unwrap().is_empty());

        let dst = MemEngine::new();
        import(&dst, b"").await.unwrap();
        assert!(dst.scan().await.unwrap().is_empty());
    }
}
