mod tests_prefix;
