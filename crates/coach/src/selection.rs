use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use runsync_transport::{ActivityClass, ActivityClassification, ActivityClassifier, ActivityId};
use snafu::IntoError;

use super::error::{BatchClassificationFailedSnafu, SessionResult};

const MANUAL_CONFIDENCE: f64 = 1.0;
const MANUAL_REASONING: &str = "Manual classification";

/// Multi-selection over an externally ordered activity list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivitySelection {
    selected: BTreeSet<ActivityId>,
    anchor: Option<ActivityId>,
}

impl ActivitySelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles a click on `activities[index]`.
    ///
    /// A plain click toggles one activity and moves the anchor. A shift-click selects
    /// the inclusive range between the anchor and the clicked row; without a visible
    /// anchor it behaves like a plain click.
    pub fn click(&mut self, activities: &[ActivityId], index: usize, shift: bool) {
        let Some(&clicked) = activities.get(index) else {
            return;
        };

        let anchor_index = self
            .anchor
            .and_then(|anchor| activities.iter().position(|id| *id == anchor));

        match anchor_index {
            Some(anchor_index) if shift => {
                let (start, end) = if anchor_index <= index {
                    (anchor_index, index)
                } else {
                    (index, anchor_index)
                };
                self.selected.extend(activities[start..=end].iter().copied());
            }
            _ => {
                if !self.selected.remove(&clicked) {
                    self.selected.insert(clicked);
                }
                self.anchor = Some(clicked);
            }
        }
    }

    pub fn select_all(&mut self, activities: &[ActivityId]) {
        self.selected.extend(activities.iter().copied());
    }

    pub fn clear(&mut self) {
        self.selected.clear();
        self.anchor = None;
    }

    /// Drops selected activities that are no longer in the list, e.g. after filtering.
    pub fn retain_visible(&mut self, activities: &[ActivityId]) {
        self.selected.retain(|id| activities.contains(id));
        if self.anchor.is_some_and(|anchor| !activities.contains(&anchor)) {
            self.anchor = None;
        }
    }

    pub fn is_selected(&self, activity_id: ActivityId) -> bool {
        self.selected.contains(&activity_id)
    }

    pub fn selected(&self) -> Vec<ActivityId> {
        self.selected.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

/// Whether a class of activity counts toward training load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrainingLoadPolicy {
    pub include_commute: bool,
}

impl TrainingLoadPolicy {
    pub fn includes(&self, class: ActivityClass) -> bool {
        match class {
            ActivityClass::Workout | ActivityClass::Race => true,
            ActivityClass::Recovery => false,
            ActivityClass::Commute => self.include_commute,
        }
    }

    pub fn classification(&self, class: ActivityClass) -> ActivityClassification {
        ActivityClassification {
            classification: class,
            confidence: MANUAL_CONFIDENCE,
            reasoning: MANUAL_REASONING.to_string(),
            include_in_training_load: self.includes(class),
        }
    }
}

/// Applies one manual classification to every selected activity.
#[derive(Clone)]
pub struct BatchReclassifier {
    classifier: Arc<dyn ActivityClassifier>,
    policy: TrainingLoadPolicy,
}

impl BatchReclassifier {
    pub fn new(classifier: Arc<dyn ActivityClassifier>, policy: TrainingLoadPolicy) -> Self {
        Self { classifier, policy }
    }

    pub fn policy(&self) -> TrainingLoadPolicy {
        self.policy
    }

    /// Reclassifies the selection; returns how many activities were updated.
    ///
    /// The selection is cleared only when every call succeeded, so a partial failure
    /// can be retried on the same rows.
    pub async fn reclassify(
        &self,
        selection: &mut ActivitySelection,
        class: ActivityClass,
    ) -> SessionResult<usize> {
        let targets = selection.selected();
        if targets.is_empty() {
            return Ok(0);
        }

        let classification = self.policy.classification(class);
        let calls = targets.iter().map(|activity_id| {
            self.classifier
                .classify_activity(*activity_id, classification.clone())
        });
        let results = join_all(calls).await;

        let total = results.len();
        let mut failures = results
            .into_iter()
            .zip(targets.iter())
            .filter_map(|(result, activity_id)| result.err().map(|error| (*activity_id, error)))
            .collect::<Vec<_>>();

        if failures.is_empty() {
            tracing::info!(
                count = total,
                class = class.as_str(),
                "reclassified selected activities"
            );
            selection.clear();
            return Ok(total);
        }

        let failed = failures.len();
        for (activity_id, error) in &failures {
            tracing::warn!(activity_id = %activity_id, error = %error, "activity reclassification failed");
        }
        let (_, source) = failures.remove(0);
        Err(BatchClassificationFailedSnafu {
            stage: "reclassify-activities",
            failed,
            total,
        }
        .into_error(source))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use runsync_transport::{BoxFuture, TransportError, TransportResult};

    use super::*;

    fn ids(raw: &[i64]) -> Vec<ActivityId> {
        raw.iter().copied().map(ActivityId::new).collect()
    }

    #[test]
    fn shift_click_selects_inclusive_range_in_either_direction() {
        let list = ids(&[10, 11, 12, 13, 14]);
        let mut selection = ActivitySelection::new();

        selection.click(&list, 3, false);
        selection.click(&list, 1, true);
        assert_eq!(selection.selected(), ids(&[11, 12, 13]));

        selection.clear();
        selection.click(&list, 0, false);
        selection.click(&list, 2, true);
        assert_eq!(selection.selected(), ids(&[10, 11, 12]));
    }

    #[test]
    fn plain_click_toggles() {
        let list = ids(&[1, 2]);
        let mut selection = ActivitySelection::new();
        selection.click(&list, 0, false);
        assert!(selection.is_selected(ActivityId::new(1)));
        selection.click(&list, 0, false);
        assert!(selection.is_empty());
    }

    #[test]
    fn shift_click_without_anchor_acts_as_plain_click() {
        let list = ids(&[1, 2, 3]);
        let mut selection = ActivitySelection::new();
        selection.click(&list, 2, true);
        assert_eq!(selection.selected(), ids(&[3]));
    }

    #[test]
    fn retain_visible_drops_filtered_rows_and_anchor() {
        let list = ids(&[1, 2, 3]);
        let mut selection = ActivitySelection::new();
        selection.select_all(&list);
        selection.click(&list, 0, false);

        let filtered = ids(&[2, 3]);
        selection.retain_visible(&filtered);
        assert_eq!(selection.selected(), ids(&[2, 3]));

        selection.click(&filtered, 1, true);
        assert_eq!(selection.selected(), ids(&[2]));
    }

    #[test]
    fn commute_inclusion_follows_policy() {
        let default = TrainingLoadPolicy::default();
        assert!(default.includes(ActivityClass::Workout));
        assert!(default.includes(ActivityClass::Race));
        assert!(!default.includes(ActivityClass::Recovery));
        assert!(!default.includes(ActivityClass::Commute));

        let commuter = TrainingLoadPolicy {
            include_commute: true,
        };
        assert!(commuter.includes(ActivityClass::Commute));
        assert_eq!(commuter.classification(ActivityClass::Commute).confidence, 1.0);
    }

    struct RecordingClassifier {
        fail_on: Option<ActivityId>,
        calls: Mutex<Vec<(ActivityId, ActivityClassification)>>,
    }

    impl ActivityClassifier for RecordingClassifier {
        fn classify_activity<'a>(
            &'a self,
            activity_id: ActivityId,
            classification: ActivityClassification,
        ) -> BoxFuture<'a, TransportResult<()>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push((activity_id, classification));
                if self.fail_on == Some(activity_id) {
                    return Err(TransportError::Remote {
                        stage: "test",
                        message: "not found".to_string(),
                    });
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn clears_selection_only_on_full_success() {
        let list = ids(&[1, 2, 3]);
        let classifier = Arc::new(RecordingClassifier {
            fail_on: Some(ActivityId::new(2)),
            calls: Mutex::new(Vec::new()),
        });
        let batch = BatchReclassifier::new(classifier.clone(), TrainingLoadPolicy::default());

        let mut selection = ActivitySelection::new();
        selection.select_all(&list);
        let error = batch
            .reclassify(&mut selection, ActivityClass::Commute)
            .await
            .unwrap_err();
        assert!(error.to_string().starts_with("1 of 3"));
        assert_eq!(selection.len(), 3);

        let calls = classifier.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|(_, c)| !c.include_in_training_load));

        let ok = BatchReclassifier::new(
            Arc::new(RecordingClassifier {
                fail_on: None,
                calls: Mutex::new(Vec::new()),
            }),
            TrainingLoadPolicy::default(),
        );
        assert_eq!(
            ok.reclassify(&mut selection, ActivityClass::Workout).await.unwrap(),
            3
        );
        assert!(selection.is_empty());
    }
}
