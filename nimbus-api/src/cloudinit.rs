//! Cloud-init user-data rendering.
//!
//! Template rendering is an external collaborator; the orchestrator only
//! substitutes the variables it owns into whatever template the VM or its
//! marketplace template supplies. `${var}` placeholders are replaced,
//! unknown placeholders are left untouched for the guest side to handle.

use std::collections::HashMap;

/// Variables available to user-data templates.
#[derive(Debug, Default)]
pub struct CloudInitContext {
    pub vm_name: String,
    pub hostname: String,
    pub ssh_public_key: Option<String>,
    pub password: Option<String>,
}

impl CloudInitContext {
    fn variables(&self) -> HashMap<&'static str, String> {
        let mut vars = HashMap::new();
        vars.insert("vm_name", self.vm_name.clone());
        vars.insert("hostname", self.hostname.clone());
        vars.insert(
            "ssh_public_key",
            self.ssh_public_key.clone().unwrap_or_default(),
        );
        vars.insert("password", self.password.clone().unwrap_or_default());
        vars
    }
}

const DEFAULT_TEMPLATE: &str = "#cloud-config\n\
hostname: ${hostname}\n\
ssh_authorized_keys:\n\
  - ${ssh_public_key}\n\
chpasswd:\n\
  expire: false\n\
  users:\n\
    - name: root\n\
      password: ${password}\n\
      type: text\n";

/// Render user data, substituting `${var}` placeholders.
pub fn render(template: Option<&str>, context: &CloudInitContext) -> String {
    let template = template.unwrap_or(DEFAULT_TEMPLATE);
    let mut out = template.to_string();
    for (name, value) in context.variables() {
        out = out.replace(&format!("${{{}}}", name), &value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_known_variables() {
        let context = CloudInitContext {
            vm_name: "web-1".to_string(),
            hostname: "web-1".to_string(),
            ssh_public_key: Some("ssh-ed25519 AAAA test".to_string()),
            password: Some("brisk-falcon-glides-47".to_string()),
        };
        let rendered = render(None, &context);
        assert!(rendered.contains("hostname: web-1"));
        assert!(rendered.contains("ssh-ed25519 AAAA test"));
        assert!(rendered.contains("brisk-falcon-glides-47"));
        assert!(!rendered.contains("${"));
    }

    #[test]
    fn test_render_leaves_unknown_placeholders() {
        let context = CloudInitContext {
            vm_name: "web-1".to_string(),
            hostname: "web-1".to_string(),
            ..Default::default()
        };
        let rendered = render(Some("run: ${custom_hook} on ${hostname}"), &context);
        assert_eq!(rendered, "run: ${custom_hook} on web-1");
    }
}
