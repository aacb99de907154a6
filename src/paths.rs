use std::path::{Path, PathBuf};

/// Work directory: `~/.local/share/isoprov/`
pub fn work_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("isoprov")
}

/// Tool log and console transcripts: `~/.local/share/isoprov/logs/`
pub fn logs_dir() -> PathBuf {
    work_dir().join("logs")
}

/// Generated domain definitions: `~/.local/share/isoprov/vms/`
pub fn vms_dir() -> PathBuf {
    work_dir().join("vms")
}

/// Path to the saved domain XML for a node.
pub fn domain_xml_path(node_id: &str) -> PathBuf {
    vms_dir().join(format!("{node_id}.xml"))
}

/// Partition images of a node: `<images_dir>/<id>-0.img` and `<id>-1.img`.
pub fn disk_image_paths(images_dir: &Path, node_id: &str) -> [PathBuf; 2] {
    [0, 1].map(|i| images_dir.join(format!("{node_id}-{i}.img")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_images_are_numbered_per_partition() {
        let [a, b] = disk_image_paths(Path::new("/var/lib/libvirt/images"), "controller-0-compute-1");
        assert_eq!(a, Path::new("/var/lib/libvirt/images/controller-0-compute-1-0.img"));
        assert_eq!(b, Path::new("/var/lib/libvirt/images/controller-0-compute-1-1.img"));
    }

    #[test]
    fn xml_lives_under_vms() {
        let path = domain_xml_path("controller-1");
        assert!(path.ends_with("isoprov/vms/controller-1.xml"));
    }
}
