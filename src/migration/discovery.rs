//! Candidate volume discovery
//!
//! Turns the cluster's PersistentVolumes into pending migration records:
//! only bound volumes provisioned by the vSphere CSI driver qualify.

use crate::crd::{CsiVolumeMigrationStatus, PersistentVolumeMigrationState};
use k8s_openapi::api::core::v1::PersistentVolume;
use tracing::debug;

/// vSphere CSI driver name
pub const VSPHERE_CSI_DRIVER: &str = "csi.vsphere.vmware.com";

/// Pending records for every PV of `driver`, optionally limited to `names`
pub fn discover_candidates(
    pvs: &[PersistentVolume],
    driver: &str,
    names: &[String],
) -> Vec<PersistentVolumeMigrationState> {
    pvs.iter()
        .filter_map(|pv| {
            let name = pv.metadata.name.as_deref()?;
            if !names.is_empty() && !names.iter().any(|n| n == name) {
                return None;
            }

            let spec = pv.spec.as_ref()?;
            let csi = spec.csi.as_ref().filter(|csi| csi.driver == driver)?;
            let Some(claim) = spec.claim_ref.as_ref() else {
                debug!(pv = name, "Skipping unbound volume");
                return None;
            };

            Some(PersistentVolumeMigrationState::pending(
                name,
                claim.namespace.clone().unwrap_or_default(),
                claim.name.clone().unwrap_or_default(),
                csi.volume_handle.clone(),
            ))
        })
        .collect()
}

/// Merge discovered candidates into the aggregate; returns how many were new
pub fn observe_candidates(
    status: &mut CsiVolumeMigrationStatus,
    candidates: Vec<PersistentVolumeMigrationState>,
) -> usize {
    let added = candidates
        .into_iter()
        .filter(|candidate| status.observe(candidate.clone()))
        .count();
    status.recompute();
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::VolumeMigrationStatus;
    use k8s_openapi::api::core::v1::{CSIPersistentVolumeSource, ObjectReference, PersistentVolumeSpec};
    use kube::api::ObjectMeta;

    fn pv(name: &str, driver: &str, handle: &str, claim: Option<(&str, &str)>) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                csi: Some(CSIPersistentVolumeSource {
                    driver: driver.into(),
                    volume_handle: handle.into(),
                    ..Default::default()
                }),
                claim_ref: claim.map(|(ns, n)| ObjectReference {
                    namespace: Some(ns.into()),
                    name: Some(n.into()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_discovers_single_vsphere_volume() {
        let pvs = vec![
            pv("pv-csi-1", VSPHERE_CSI_DRIVER, "file://fcd-12345", Some(("default", "test-pvc"))),
            pv("pv-ebs", "ebs.csi.aws.com", "vol-1", Some(("default", "other"))),
            pv("pv-unbound", VSPHERE_CSI_DRIVER, "file://fcd-9", None),
        ];

        let found = discover_candidates(&pvs, VSPHERE_CSI_DRIVER, &[]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pv_name, "pv-csi-1");
        assert_eq!(found[0].status, VolumeMigrationStatus::Pending);
        assert_eq!(found[0].pvc_name, "test-pvc");
        assert_eq!(found[0].pvc_namespace, "default");
        assert_eq!(found[0].source_volume_handle, "file://fcd-12345");
    }

    #[test]
    fn test_name_filter() {
        let pvs = vec![
            pv("a", VSPHERE_CSI_DRIVER, "fcd-a", Some(("ns", "a"))),
            pv("b", VSPHERE_CSI_DRIVER, "fcd-b", Some(("ns", "b"))),
        ];
        let found = discover_candidates(&pvs, VSPHERE_CSI_DRIVER, &["b".to_string()]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pv_name, "b");
    }

    #[test]
    fn test_observe_keeps_existing_records() {
        let mut status = CsiVolumeMigrationStatus::default();
        let mut failed = PersistentVolumeMigrationState::pending("a", "ns", "a", "fcd-a");
        failed.fail("boom");
        status.observe(failed);

        let pvs = vec![
            pv("a", VSPHERE_CSI_DRIVER, "fcd-a", Some(("ns", "a"))),
            pv("b", VSPHERE_CSI_DRIVER, "fcd-b", Some(("ns", "b"))),
        ];
        let added = observe_candidates(&mut status, discover_candidates(&pvs, VSPHERE_CSI_DRIVER, &[]));

        assert_eq!(added, 1);
        assert_eq!(status.total_volumes, 2);
        assert_eq!(status.failed_volumes, 1);
        assert_eq!(status.volume("a").unwrap().status, VolumeMigrationStatus::Failed);
    }
}
