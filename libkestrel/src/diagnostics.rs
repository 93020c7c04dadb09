//! Collects errors raised from parallel passes. Passes that can usefully produce more than one
//! diagnostic (symbol resolution, relocation scanning) push errors here and keep going; a
//! checkpoint at the end of the pass fails the link if anything was recorded.

use crate::error::Error;
use crate::error::Result;
use anyhow::bail;
use crossbeam_queue::SegQueue;

#[derive(Default)]
pub(crate) struct DiagnosticSink {
    errors: SegQueue<Error>,
}

impl DiagnosticSink {
    pub(crate) fn error(&self, error: Error) {
        self.errors.push(error);
    }

    pub(crate) fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Fails the link if any error has been recorded since the last checkpoint. All pending
    /// diagnostics are printed; the returned error carries only a summary, since the details have
    /// already gone to stderr.
    pub(crate) fn checkpoint(&self) -> Result {
        let mut count = 0;
        while let Some(error) = self.errors.pop() {
            eprintln!("kestrel: error: {error:#}");
            count += 1;
        }
        if count > 0 {
            bail!("link failed with {count} error(s)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn checkpoint_passes_when_empty() {
        let sink = DiagnosticSink::default();
        assert!(sink.checkpoint().is_ok());
    }

    #[test]
    fn checkpoint_fails_after_error() {
        let sink = DiagnosticSink::default();
        sink.error(anyhow!("boom"));
        assert!(sink.has_errors());
        assert!(sink.checkpoint().is_err());
        // The queue is drained by the checkpoint.
        assert!(sink.checkpoint().is_ok());
    }
}
