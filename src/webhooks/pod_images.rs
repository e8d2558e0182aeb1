//! Extraction of container image references from pod specs.
//!
//! Both admission handlers operate on the same set of references: regular
//! containers, init containers and ephemeral containers (the latter arrive
//! via the pods/ephemeralcontainers subresource but still carry a full Pod
//! object). Each extracted image remembers the JSON pointer of its `image`
//! field so the mutating handler can emit a patch for it.

use k8s_openapi::api::core::v1::Pod;

/// One container image reference found in a pod spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodImage {
    /// Container name, used in admission messages
    pub container: String,
    /// Image reference string as it appears in the pod spec
    pub image: String,
    /// JSON pointer to the image field, e.g. `/spec/containers/0/image`
    pub json_pointer: String,
}

/// Collect every container image reference in the pod, in spec order.
pub fn pod_images(pod: &Pod) -> Vec<PodImage> {
    let mut images = Vec::new();
    let Some(spec) = &pod.spec else {
        return images;
    };

    for (i, container) in spec.containers.iter().enumerate() {
        if let Some(image) = &container.image {
            images.push(PodImage {
                container: container.name.clone(),
                image: image.clone(),
                json_pointer: format!("/spec/containers/{i}/image"),
            });
        }
    }
    if let Some(init_containers) = &spec.init_containers {
        for (i, container) in init_containers.iter().enumerate() {
            if let Some(image) = &container.image {
                images.push(PodImage {
                    container: container.name.clone(),
                    image: image.clone(),
                    json_pointer: format!("/spec/initContainers/{i}/image"),
                });
            }
        }
    }
    if let Some(ephemeral_containers) = &spec.ephemeral_containers {
        for (i, container) in ephemeral_containers.iter().enumerate() {
            if let Some(image) = &container.image {
                images.push(PodImage {
                    container: container.name.clone(),
                    image: image.clone(),
                    json_pointer: format!("/spec/ephemeralContainers/{i}/image"),
                });
            }
        }
    }
    images
}
