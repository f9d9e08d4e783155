mod dag;
mod state_machine;
