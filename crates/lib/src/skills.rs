//! Skills: markdown documents injected into the agent's system prompt.
//!
//! Each skill is a directory with a SKILL.md (optional YAML frontmatter +
//! markdown body). Later directories win on name collisions.

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// A loaded skill.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Raw SKILL.md content.
    pub content: String,
    pub path: PathBuf,
}

/// Frontmatter parsed from SKILL.md (minimal).
#[derive(Debug, Default, Deserialize)]
struct SkillFrontmatter {
    name: Option<String>,
    description: Option<String>,
}

/// Load all skills from the given directories. Each dir holds subdirs, each
/// with a SKILL.md. Later dirs overwrite earlier ones by name.
pub fn load_skills(dirs: &[PathBuf]) -> Result<Vec<Skill>> {
    let mut merged: std::collections::HashMap<String, Skill> = std::collections::HashMap::new();
    for dir in dirs {
        for skill in load_skills_from_dir(dir) {
            merged.insert(skill.name.clone(), skill);
        }
    }
    let mut skills: Vec<Skill> = merged.into_values().collect();
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(skills)
}

fn load_skills_from_dir(dir: &Path) -> Vec<Skill> {
    let mut out = Vec::new();
    let read_dir = match std::fs::read_dir(dir) {
        Ok(d) => d,
        Err(_) => return out,
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let skill_md = path.join("SKILL.md");
        let content = match std::fs::read_to_string(&skill_md) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let (name, description) = parse_skill_frontmatter(&content, &path);
        out.push(Skill {
            name,
            description,
            content,
            path,
        });
    }
    out
}

fn parse_skill_frontmatter(content: &str, fallback_path: &Path) -> (String, String) {
    let mut name = fallback_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();
    let mut description = String::new();

    if content.starts_with("---") {
        if let Some(end) = content[3..].find("---") {
            let yaml = content[3..3 + end].trim();
            if let Ok(fm) = serde_yaml::from_str::<SkillFrontmatter>(yaml) {
                if let Some(n) = fm.name {
                    name = n;
                }
                if let Some(d) = fm.description {
                    description = d;
                }
            }
        }
    }

    (name, description)
}

/// Render the "Available Skills" appendix appended to the persona prompt.
/// Empty when no skills are loaded.
pub fn system_prompt_appendix(skills: &[Skill]) -> String {
    if skills.is_empty() {
        return String::new();
    }
    let sections: Vec<String> = skills
        .iter()
        .map(|s| format!("## Skill: {}\n\n{}", s.name, s.content.trim()))
        .collect();
    format!(
        "\n\n---\n# Available Skills\n\n{}",
        sections.join("\n\n---\n\n")
    )
}
