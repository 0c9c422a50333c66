//! CPU inventory.
//!
//! Reads the affinity mask of the calling process rather than the system-wide
//! CPU count, so a process started inside a cpuset-restricted container only
//! sees the CPUs it may actually run on.

use nix::sched::{CpuSet, sched_getaffinity};
use nix::unistd::Pid;

use crate::error::{PoolError, Result};

/// CPU ids in the calling process's affinity mask, in ascending order.
///
/// Fails with [`PoolError::CpuQuery`] if the mask cannot be read or is empty.
pub fn online_cpus() -> Result<Vec<usize>> {
    let set = sched_getaffinity(Pid::from_raw(0))
        .map_err(|e| PoolError::CpuQuery(format!("sched_getaffinity: {e}")))?;
    let cpus = cpus_in(&set);
    if cpus.is_empty() {
        return Err(PoolError::CpuQuery("affinity mask is empty".into()));
    }
    Ok(cpus)
}

/// Comma-separated affinity mask of the calling process, e.g. `"0,1,2,3"`.
pub fn affinity_string() -> Result<String> {
    let set = sched_getaffinity(Pid::from_raw(0))
        .map_err(|e| PoolError::CpuQuery(format!("sched_getaffinity: {e}")))?;
    let ids: Vec<String> = cpus_in(&set).iter().map(usize::to_string).collect();
    Ok(ids.join(","))
}

fn cpus_in(set: &CpuSet) -> Vec<usize> {
    (0..CpuSet::count())
        .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
        .collect()
}

/// Parse a kernel-style CPU list such as `"0-3,6,8-9"`.
///
/// Order is preserved and duplicates are kept: the result maps directly onto
/// worker slots.
pub fn parse_cpu_list(input: &str) -> Result<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in input.split(',').map(str::trim) {
        if part.is_empty() {
            return Err(PoolError::InvalidConfig(format!(
                "empty entry in cpu list {input:?}"
            )));
        }
        match part.split_once('-') {
            Some((start, end)) => {
                let start = parse_cpu(start, input)?;
                let end = parse_cpu(end, input)?;
                if start > end {
                    return Err(PoolError::InvalidConfig(format!(
                        "descending range {part:?} in cpu list {input:?}"
                    )));
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(parse_cpu(part, input)?),
        }
    }
    Ok(cpus)
}

/// Ids at or past the [`CpuSet`] capacity could never be pinned to.
fn parse_cpu(value: &str, input: &str) -> Result<usize> {
    let cpu: usize = value.trim().parse().map_err(|_| {
        PoolError::InvalidConfig(format!("invalid cpu id {value:?} in cpu list {input:?}"))
    })?;
    if cpu >= CpuSet::count() {
        return Err(PoolError::InvalidConfig(format!(
            "cpu id {cpu} in cpu list {input:?} is not below the cpu set capacity of {}",
            CpuSet::count()
        )));
    }
    Ok(cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_cpus_is_sorted_and_non_empty() {
        let cpus = online_cpus().unwrap();
        assert!(!cpus.is_empty());
        assert!(cpus.windows(2).all(|w| w[0] < w[1]), "cpus: {cpus:?}");
    }

    #[test]
    fn affinity_string_matches_online_cpus() {
        let cpus = online_cpus().unwrap();
        let expected: Vec<String> = cpus.iter().map(usize::to_string).collect();
        assert_eq!(affinity_string().unwrap(), expected.join(","));
    }

    #[test]
    fn parse_single_ids() {
        assert_eq!(parse_cpu_list("3").unwrap(), vec![3]);
        assert_eq!(parse_cpu_list("2, 0,1").unwrap(), vec![2, 0, 1]);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_cpu_list("0-3,6").unwrap(), vec![0, 1, 2, 3, 6]);
        assert_eq!(parse_cpu_list("4-4").unwrap(), vec![4]);
    }

    #[test]
    fn parse_keeps_duplicates() {
        assert_eq!(parse_cpu_list("1,1,0-1").unwrap(), vec![1, 1, 0, 1]);
    }

    #[test]
    fn parse_rejects_garbage() {
        for input in ["", "a", "1,,2", "3-1", "1-", "-2", "0-x"] {
            let err = parse_cpu_list(input).unwrap_err();
            assert!(
                matches!(err, PoolError::InvalidConfig(_)),
                "{input:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn parse_rejects_ids_beyond_cpu_set_capacity() {
        let capacity = CpuSet::count();
        let at_capacity = capacity.to_string();
        let range_to_capacity = format!("0-{capacity}");
        for input in ["5000", "0-4000000000", &at_capacity, &range_to_capacity] {
            let err = parse_cpu_list(input).unwrap_err();
            assert!(
                matches!(err, PoolError::InvalidConfig(_)),
                "{input:?} gave {err:?}"
            );
        }

        let last = capacity - 1;
        assert_eq!(parse_cpu_list(&last.to_string()).unwrap(), vec![last]);
    }
}
