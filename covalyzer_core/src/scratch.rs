use crate::testcase::Testcase;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tempfile::TempDir;

/// A per-batch input directory in the scratch filesystem.
///
/// Every testcase of the batch is written to its own `id_<id>` file. The directory
/// is removed when the value is dropped, so an early return or a failed write never
/// leaves it behind; [`EphemeralBatchDir::close`] removes it eagerly and reports
/// removal errors instead of swallowing them.
#[derive(Debug)]
pub struct EphemeralBatchDir {
    dir: TempDir,
    files: usize,
}

impl EphemeralBatchDir {
    pub fn materialize(scratch_root: &Path, testcases: &[Testcase]) -> io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("covalyzer-batch-")
            .tempdir_in(scratch_root)?;
        for tc in testcases {
            let mut writer = BufWriter::new(File::create(dir.path().join(tc.file_name()))?);
            writer.write_all(tc.as_bytes())?;
            writer.flush()?;
        }
        Ok(Self {
            dir,
            files: testcases.len(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn len(&self) -> usize {
        self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files == 0
    }

    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}
