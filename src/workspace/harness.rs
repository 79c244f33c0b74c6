//! Fixed test tooling merged into every workspace.
//!
//! The sandbox image ships these packages pre-installed under
//! [`SHARED_MODULES_DIR`], so a submission that declares nothing extra runs
//! without touching the network.

use std::collections::BTreeMap;

use serde_json::json;

/// Where the sandbox image keeps the pre-installed harness packages
pub const SHARED_MODULES_DIR: &str = "/opt/harness/node_modules";

/// Structured test-runner artifact, relative to the workspace root
pub const RESULTS_FILE: &str = "test-results.json";

/// Packages the harness depends on. Candidates may never replace these.
const TOOLING: &[(&str, &str)] = &[
    ("@babel/core", "^7.24.0"),
    ("@babel/preset-env", "^7.24.0"),
    ("@babel/preset-react", "^7.24.0"),
    ("@testing-library/jest-dom", "^6.4.2"),
    ("babel-jest", "^29.7.0"),
    ("jest", "^29.7.0"),
    ("jest-environment-jsdom", "^29.7.0"),
];

/// Runtime packages pre-installed in the image. Candidates may pin other versions.
const RUNTIME: &[(&str, &str)] = &[
    ("@testing-library/react", "^14.2.1"),
    ("@testing-library/user-event", "^14.5.2"),
    ("react", "^18.2.0"),
    ("react-dom", "^18.2.0"),
];

const BABEL_CONFIG: &str = r#"module.exports = {
  presets: [
    ['@babel/preset-env', { targets: { node: 'current' } }],
    ['@babel/preset-react', { runtime: 'automatic' }],
  ],
};
"#;

const JEST_CONFIG: &str = r#"module.exports = {
  testEnvironment: 'jsdom',
  transform: { '^.+\\.[jt]sx?$': 'babel-jest' },
  moduleNameMapper: {
    '\\.(css|less|scss|sass)$': '<rootDir>/__mocks__/styleMock.js',
    '\\.(png|jpe?g|gif|svg|webp)$': '<rootDir>/__mocks__/fileMock.js',
  },
  setupFilesAfterEnv: ['<rootDir>/jest.setup.js'],
  testPathIgnorePatterns: ['/node_modules/'],
};
"#;

const JEST_SETUP: &str = "import '@testing-library/jest-dom';\n";

const STYLE_MOCK: &str = "module.exports = {};\n";

const FILE_MOCK: &str = "module.exports = 'test-file-stub';\n";

pub fn is_tooling(name: &str) -> bool {
    TOOLING.iter().any(|(tool, _)| *tool == name)
}

/// Runtime dependencies after applying the candidate's declarations
///
/// Candidate versions win over the base runtime packages; tooling names are
/// dropped so the harness stays intact.
pub fn merge_dependencies(candidate: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut merged: BTreeMap<String, String> = RUNTIME
        .iter()
        .map(|(name, version)| (name.to_string(), version.to_string()))
        .collect();

    for (name, version) in candidate {
        if is_tooling(name) {
            log::debug!("Ignoring candidate override of harness package {name}");
            continue;
        }
        merged.insert(name.clone(), version.clone());
    }

    merged
}

/// Whether the candidate asked for anything the image does not already have
pub fn needs_install(candidate: &BTreeMap<String, String>) -> bool {
    candidate.iter().any(|(name, version)| {
        !is_tooling(name)
            && !RUNTIME
                .iter()
                .any(|(base, base_version)| base == name && base_version == version)
    })
}

/// The merged `package.json`
pub fn manifest(candidate: &BTreeMap<String, String>) -> serde_json::Value {
    let dev_dependencies: BTreeMap<&str, &str> = TOOLING.iter().copied().collect();

    json!({
        "name": "sandbox-workspace",
        "version": "0.0.0",
        "private": true,
        "scripts": { "test": "jest" },
        "dependencies": merge_dependencies(candidate),
        "devDependencies": dev_dependencies,
    })
}

/// Framework configuration files, as `(relative path, content)` pairs
pub fn config_files() -> [(&'static str, &'static str); 5] {
    [
        ("babel.config.js", BABEL_CONFIG),
        ("jest.config.js", JEST_CONFIG),
        ("jest.setup.js", JEST_SETUP),
        ("__mocks__/styleMock.js", STYLE_MOCK),
        ("__mocks__/fileMock.js", FILE_MOCK),
    ]
}
