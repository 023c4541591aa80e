//! Local persistence of accepted metadata replicas
//!
//! The replication core hands accepted artifacts to listeners; this one
//! writes each to a file under the daemon's data directory so a restart
//! can pick up from the last known state.

use std::path::PathBuf;
use strata_sync::{ActionMsg, RecvListener, ReplicatedArtifact};
use tracing::{debug, error};

pub struct MetaPersister {
    dir: PathBuf,
}

impl MetaPersister {
    pub fn new(dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!(dir = %dir.display(), "cannot create data directory: {e}");
        }
        Self { dir }
    }

    fn write(&self, name: &str, bytes: &[u8]) -> std::io::Result<()> {
        let tmp = self.dir.join(format!(".{name}.tmp"));
        let path = self.dir.join(name);
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)
    }
}

impl RecvListener for MetaPersister {
    fn artifact_received(&self, artifact: &ReplicatedArtifact, _msg: &ActionMsg) {
        let bytes = match artifact {
            ReplicatedArtifact::Smap(smap) => serde_json::to_vec_pretty(&**smap),
            ReplicatedArtifact::BucketMd(bmd) => serde_json::to_vec_pretty(&**bmd),
            ReplicatedArtifact::Tokens(tokens) => serde_json::to_vec_pretty(&**tokens),
        };
        let bytes = match bytes {
            Ok(b) => b,
            Err(e) => {
                error!(tag = artifact.tag(), "cannot serialize replica: {e}");
                return;
            }
        };
        let name = format!("{}.json", artifact.tag());
        match self.write(&name, &bytes) {
            Ok(()) => debug!(
                tag = artifact.tag(),
                version = artifact.version(),
                "replica persisted"
            ),
            Err(e) => error!(tag = artifact.tag(), "cannot persist replica: {e}"),
        }
    }
}
