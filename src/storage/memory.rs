//! In-process store backed by `parking_lot` locks

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use super::{ExperimentFilter, ExperimentStore, StoreResult};
use crate::errors::StoreError;
use crate::experiment::types::{
    Assignment, Comparison, Experiment, MetricResult, ResultKey, VariantId,
};

#[derive(Default)]
pub struct InMemoryStore {
    experiments: RwLock<HashMap<String, Experiment>>,
    /// (experiment_id, user_id) -> assignment
    assignments: RwLock<HashMap<(String, String), Assignment>>,
    results: RwLock<BTreeMap<ResultKey, MetricResult>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExperimentStore for InMemoryStore {
    fn insert_experiment(&self, experiment: &Experiment) -> StoreResult<()> {
        let mut experiments = self.experiments.write();
        if experiments.contains_key(&experiment.id) {
            return Err(StoreError::Duplicate(format!("experiment {}", experiment.id)));
        }
        experiments.insert(experiment.id.clone(), experiment.clone());
        Ok(())
    }

    fn get_experiment(&self, experiment_id: &str) -> StoreResult<Option<Experiment>> {
        Ok(self.experiments.read().get(experiment_id).cloned())
    }

    fn update_experiment(&self, experiment: &Experiment) -> StoreResult<()> {
        let mut experiments = self.experiments.write();
        match experiments.get_mut(&experiment.id) {
            Some(existing) => {
                *existing = experiment.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!(
                "experiment {} does not exist",
                experiment.id
            ))),
        }
    }

    fn delete_experiment(&self, experiment_id: &str) -> StoreResult<bool> {
        let removed = self.experiments.write().remove(experiment_id).is_some();
        self.assignments
            .write()
            .retain(|(exp, _), _| exp != experiment_id);
        self.results
            .write()
            .retain(|key, _| key.experiment_id != experiment_id);
        Ok(removed)
    }

    fn list_experiments(&self, filter: &ExperimentFilter) -> StoreResult<Vec<Experiment>> {
        let all = self.experiments.read().values().cloned().collect();
        Ok(filter.apply(all))
    }

    fn insert_assignment(&self, assignment: &Assignment) -> StoreResult<()> {
        let key = (assignment.experiment_id.clone(), assignment.user_id.clone());
        let mut assignments = self.assignments.write();
        if assignments.contains_key(&key) {
            return Err(StoreError::Duplicate(format!(
                "assignment {}/{}",
                key.0, key.1
            )));
        }
        assignments.insert(key, assignment.clone());
        Ok(())
    }

    fn get_assignment(
        &self,
        experiment_id: &str,
        user_id: &str,
    ) -> StoreResult<Option<Assignment>> {
        Ok(self
            .assignments
            .read()
            .get(&(experiment_id.to_string(), user_id.to_string()))
            .cloned())
    }

    fn assignments_for_user(&self, user_id: &str) -> StoreResult<Vec<Assignment>> {
        let mut found: Vec<Assignment> = self
            .assignments
            .read()
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.experiment_id.cmp(&b.experiment_id));
        Ok(found)
    }

    fn assignment_counts(&self, experiment_id: &str) -> StoreResult<BTreeMap<VariantId, u64>> {
        let mut counts = BTreeMap::new();
        for assignment in self
            .assignments
            .read()
            .values()
            .filter(|a| a.experiment_id == experiment_id)
        {
            *counts.entry(assignment.variant_id.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn get_result(&self, key: &ResultKey) -> StoreResult<Option<MetricResult>> {
        Ok(self.results.read().get(key).cloned())
    }

    fn compare_and_swap_result(
        &self,
        expected_version: Option<u64>,
        row: &MetricResult,
    ) -> StoreResult<()> {
        let mut results = self.results.write();
        let current = results.get(&row.key).map(|r| r.version);
        if current != expected_version {
            return Err(StoreError::Conflict(format!(
                "result {}/{}/{}",
                row.key.experiment_id, row.key.variant_id, row.key.metric_id
            )));
        }
        results.insert(row.key.clone(), row.clone());
        Ok(())
    }

    fn set_comparison(&self, key: &ResultKey, comparison: Option<Comparison>) -> StoreResult<()> {
        if let Some(row) = self.results.write().get_mut(key) {
            row.comparison = comparison;
        }
        Ok(())
    }

    fn results_for_experiment(&self, experiment_id: &str) -> StoreResult<Vec<MetricResult>> {
        Ok(self
            .results
            .read()
            .values()
            .filter(|r| r.key.experiment_id == experiment_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::types::{AllocationMethod, ExperimentDefinition, VariantDefinition};
    use chrono::Utc;

    fn experiment(name: &str) -> Experiment {
        ExperimentDefinition::builder(name)
            .with_variant(VariantDefinition::new("a", 100.0))
            .build()
            .into_experiment(Utc::now())
    }

    fn assignment(experiment_id: &str, user_id: &str, variant_id: &str) -> Assignment {
        Assignment {
            experiment_id: experiment_id.to_string(),
            user_id: user_id.to_string(),
            variant_id: variant_id.to_string(),
            method: AllocationMethod::WeightedRandom,
            cohort: None,
            assigned_at: Utc::now(),
        }
    }

    #[test]
    fn test_assignment_uniqueness() {
        let store = InMemoryStore::new();
        store.insert_assignment(&assignment("e", "u", "v1")).unwrap();
        let err = store.insert_assignment(&assignment("e", "u", "v2")).unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
        assert_eq!(
            store.get_assignment("e", "u").unwrap().unwrap().variant_id,
            "v1"
        );
    }

    #[test]
    fn test_compare_and_swap() {
        let store = InMemoryStore::new();
        let key = ResultKey::new("e", "v", "m");
        let first = MetricResult::first(key.clone(), 1.0, Utc::now());

        store.compare_and_swap_result(None, &first).unwrap();
        assert!(matches!(
            store.compare_and_swap_result(None, &first),
            Err(StoreError::Conflict(_))
        ));

        let second = first.observe(3.0, Utc::now());
        store.compare_and_swap_result(Some(1), &second).unwrap();
        assert!(store.compare_and_swap_result(Some(1), &second).is_err());
        assert_eq!(store.get_result(&key).unwrap().unwrap().value, 2.0);
    }

    #[test]
    fn test_delete_cascades() {
        let store = InMemoryStore::new();
        let exp = experiment("cascade");
        store.insert_experiment(&exp).unwrap();
        store.insert_assignment(&assignment(&exp.id, "u", "v")).unwrap();
        store
            .compare_and_swap_result(
                None,
                &MetricResult::first(ResultKey::new(&exp.id, "v", "m"), 1.0, Utc::now()),
            )
            .unwrap();

        assert!(store.delete_experiment(&exp.id).unwrap());
        assert!(store.get_assignment(&exp.id, "u").unwrap().is_none());
        assert!(store.results_for_experiment(&exp.id).unwrap().is_empty());
        assert!(!store.delete_experiment(&exp.id).unwrap());
    }

    #[test]
    fn test_list_filter_and_pagination() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            let mut exp = experiment(&format!("exp-{i}"));
            exp.created_at = Utc::now() + chrono::Duration::seconds(i);
            if i % 2 == 0 {
                exp.status = crate::experiment::types::ExperimentStatus::Active;
            }
            store.insert_experiment(&exp).unwrap();
        }

        let active = store
            .list_experiments(&ExperimentFilter::with_status(
                crate::experiment::types::ExperimentStatus::Active,
            ))
            .unwrap();
        assert_eq!(active.len(), 3);

        let page = store
            .list_experiments(&ExperimentFilter {
                status: None,
                offset: 1,
                limit: Some(2),
            })
            .unwrap();
        let names: Vec<_> = page.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["exp-1", "exp-2"]);
    }
}
