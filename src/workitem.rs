use std::io::{Cursor, Read, Write};

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::platform::JobMeta;

/// One unit of work flowing from a producer through the disk queue to a
/// worker. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    JobTrace {
        meta: JobMeta,
    },
    Artifact {
        meta: JobMeta,
        #[serde(skip_serializing_if = "Option::is_none")]
        size_hint: Option<u64>,
    },
    DotEnvArtifact {
        meta: JobMeta,
    },
}

const TAG_JOB_TRACE: u8 = 1;
const TAG_ARTIFACT: u8 = 2;
const TAG_DOTENV: u8 = 3;

impl WorkItem {
    pub fn meta(&self) -> &JobMeta {
        match self {
            WorkItem::JobTrace { meta }
            | WorkItem::Artifact { meta, .. }
            | WorkItem::DotEnvArtifact { meta } => meta,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::JobTrace { .. } => "trace",
            WorkItem::Artifact { .. } => "artifact",
            WorkItem::DotEnvArtifact { .. } => "dotenv",
        }
    }

    /// Queue wire format: one discriminator byte, then a u32-LE length, then
    /// a JSON payload of that length.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let tag = match self {
            WorkItem::JobTrace { .. } => TAG_JOB_TRACE,
            WorkItem::Artifact { .. } => TAG_ARTIFACT,
            WorkItem::DotEnvArtifact { .. } => TAG_DOTENV,
        };
        let payload = serde_json::to_vec(self).context("failed to serialize work item")?;
        let mut out = Vec::with_capacity(payload.len() + 5);
        out.write_u8(tag)?;
        out.write_u32::<LittleEndian>(payload.len() as u32)?;
        out.write_all(&payload)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let tag = cursor.read_u8().context("work item record is empty")?;
        let len = cursor.read_u32::<LittleEndian>().context("work item record is truncated")? as usize;
        let mut payload = vec![0u8; len];
        cursor
            .read_exact(&mut payload)
            .context("work item payload is truncated")?;
        let item: WorkItem =
            serde_json::from_slice(&payload).context("failed to deserialize work item")?;
        let expected = match item {
            WorkItem::JobTrace { .. } => TAG_JOB_TRACE,
            WorkItem::Artifact { .. } => TAG_ARTIFACT,
            WorkItem::DotEnvArtifact { .. } => TAG_DOTENV,
        };
        if tag != expected {
            bail!("work item discriminator {tag} does not match payload");
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::platform::Platform;

    fn meta() -> JobMeta {
        JobMeta {
            platform: Platform::Gitlab,
            base_url: "https://gitlab.example.com".into(),
            project_id: "42".into(),
            project_path: "group/app".into(),
            job_id: "1001".into(),
            job_name: "build".into(),
            pipeline_id: Some("77".into()),
        }
    }

    #[test]
    fn codec_round_trips_every_variant() {
        let items = [
            WorkItem::JobTrace { meta: meta() },
            WorkItem::Artifact { meta: meta(), size_hint: Some(1 << 20) },
            WorkItem::DotEnvArtifact { meta: meta() },
        ];
        for item in items {
            let bytes = item.encode().unwrap();
            assert_eq!(WorkItem::decode(&bytes).unwrap(), item);
        }
    }

    #[test]
    fn discriminator_mismatch_is_rejected() {
        let mut bytes = WorkItem::JobTrace { meta: meta() }.encode().unwrap();
        bytes[0] = TAG_ARTIFACT;
        assert!(WorkItem::decode(&bytes).is_err());
    }

    #[test]
    fn truncated_record_is_rejected() {
        let bytes = WorkItem::JobTrace { meta: meta() }.encode().unwrap();
        assert!(WorkItem::decode(&bytes[..bytes.len() - 3]).is_err());
    }
}
