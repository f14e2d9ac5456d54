use serde::{Deserialize, Serialize};

use crate::pipeline::stages::{JobSource, StageKind};

/// Ordered stage list split into segments. Stages inside a segment chain
/// automatically; moving to the next segment needs an explicit advance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDescriptor {
    segments: Vec<Vec<StageKind>>,
}

impl PipelineDescriptor {
    /// Resume optimization: analysis first, generation after review. A job
    /// reference adds a scrape stage; supplied text goes straight to analysis.
    /// The generated resume is scored again before conversion.
    pub fn for_job_source(job: &JobSource) -> Self {
        let mut analysis = vec![StageKind::Extract];
        if job.is_reference() {
            analysis.push(StageKind::Scrape);
        }
        analysis.push(StageKind::Analyze);

        Self {
            segments: vec![
                analysis,
                vec![StageKind::Generate, StageKind::Rescore, StageKind::Convert],
            ],
        }
    }

    pub fn segments(&self) -> &[Vec<StageKind>] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&[StageKind]> {
        self.segments.get(index).map(Vec::as_slice)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Every stage in execution order.
    pub fn stages(&self) -> Vec<StageKind> {
        self.segments.iter().flatten().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_source_scrapes_after_extract() {
        let descriptor =
            PipelineDescriptor::for_job_source(&JobSource::Reference("123".into()));
        assert_eq!(descriptor.stages()[1], StageKind::Scrape);
        assert_eq!(
            descriptor.segment(0),
            Some(&[StageKind::Extract, StageKind::Scrape, StageKind::Analyze][..])
        );
    }

    #[test]
    fn test_text_source_analyzes_directly() {
        let descriptor = PipelineDescriptor::for_job_source(&JobSource::Text("Rust".into()));
        assert_eq!(descriptor.stages()[1], StageKind::Analyze);
        assert!(!descriptor.stages().contains(&StageKind::Scrape));
    }

    #[test]
    fn test_generation_is_its_own_segment() {
        let descriptor = PipelineDescriptor::for_job_source(&JobSource::Text("Rust".into()));
        assert_eq!(descriptor.segment_count(), 2);
        assert_eq!(
            descriptor.segment(1),
            Some(&[StageKind::Generate, StageKind::Rescore, StageKind::Convert][..])
        );
        assert_eq!(descriptor.segment(2), None);
    }
}
