//! Dependency layering for pipeline steps.

use std::collections::HashSet;

use crate::core::types::StepConfig;
use crate::error::ConfigError;

/// Topologically layer `steps`: every step lands in exactly one layer and each
/// of its dependencies lives in a strictly earlier layer. Steps keep pipeline
/// order inside a layer.
pub fn resolve_layers(steps: &[StepConfig]) -> Result<Vec<Vec<&StepConfig>>, ConfigError> {
    let mut names = HashSet::with_capacity(steps.len());
    for step in steps {
        if !names.insert(step.name.as_str()) {
            return Err(ConfigError::DuplicateStep(step.name.clone()));
        }
    }
    for step in steps {
        if let Some(missing) = step
            .depends_on
            .iter()
            .find(|dep| !names.contains(dep.as_str()))
        {
            return Err(ConfigError::UnknownDependency {
                step: step.name.clone(),
                dependency: missing.clone(),
            });
        }
    }

    let mut placed: HashSet<&str> = HashSet::with_capacity(steps.len());
    let mut remaining: Vec<&StepConfig> = steps.iter().collect();
    let mut layers = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&StepConfig>, Vec<&StepConfig>) = remaining
            .into_iter()
            .partition(|step| step.depends_on.iter().all(|dep| placed.contains(dep.as_str())));
        if ready.is_empty() {
            return Err(ConfigError::CyclicDependency(
                blocked.iter().map(|step| step.name.clone()).collect(),
            ));
        }
        placed.extend(ready.iter().map(|step| step.name.as_str()));
        layers.push(ready);
        remaining = blocked;
    }

    Ok(layers)
}

/// Split a layer into execution sub-groups.
///
/// Steps sharing a `parallel_group` tag form one concurrent group placed at
/// the tag's first appearance; untagged steps are singletons.
pub fn group_by_parallel<'a>(layer: &[&'a StepConfig]) -> Vec<Vec<&'a StepConfig>> {
    let mut groups: Vec<Vec<&'a StepConfig>> = Vec::new();
    let mut tags: Vec<(&str, usize)> = Vec::new();

    for &step in layer {
        match step.parallel_group.as_deref() {
            Some(tag) => match tags.iter().find(|(t, _)| *t == tag).map(|(_, i)| *i) {
                Some(index) => groups[index].push(step),
                None => {
                    tags.push((tag, groups.len()));
                    groups.push(vec![step]);
                }
            },
            None => groups.push(vec![step]),
        }
    }

    groups
}
