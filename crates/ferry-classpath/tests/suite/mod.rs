mod support;

mod export;
mod import;
mod logging;
mod publish;
mod scopes;
