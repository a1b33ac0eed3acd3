mod e2e {
    mod helpers;
    mod test_errors;
    mod test_expressions;
    mod test_functions;
    mod test_statements;
}
